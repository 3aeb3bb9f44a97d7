//! Scripts run inside interpreters.
//!
//! A deliberately small statement language: enough to bind names, call
//! registered native functions, define simple functions and raise. Scripts
//! are compiled to a serializable tree, which is what lets them cross
//! interpreter boundaries as marshalled data.
//!
//! ```text
//! x = 1; y = (x, 'two', b'3')
//! def pair(a, b=None): t = (a, b); return t
//! result = pair(x, b=y)
//! del x
//! raise ValueError('bad input')
//! ```

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::registry::{Namespace, Runtime};
use crate::{
    exception::{ExcType, Exception, Frame},
    value::{Function, Value},
};

/// Calls nested deeper than this raise `RecursionError`.
const MAX_DEPTH: usize = 200;

/// A script failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({filename}, line {line})")]
pub struct ScriptError {
    pub message: String,
    pub filename: String,
    pub line: u32,
}

impl From<ScriptError> for Exception {
    fn from(err: ScriptError) -> Self {
        Self::new(ExcType::SyntaxError, err.to_string())
    }
}

// ============================================================================
// Tree
// ============================================================================

/// A compiled script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    filename: String,
    body: Vec<Stmt>,
}

/// A function defined by a `def` statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    name: String,
    qualname: String,
    filename: String,
    line: u32,
    params: Vec<Param>,
    body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Param {
    name: String,
    default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Stmt {
    line: u32,
    kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StmtKind {
    Pass,
    Assign(String, Expr),
    Delete(String),
    Raise(ExcType, Option<Expr>),
    Def(Box<FunctionDef>),
    Return(Option<Expr>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Name(String),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
}

impl Script {
    /// Compiles `source`; `filename` appears in tracebacks and syntax errors.
    pub fn compile(source: &str, filename: &str) -> Result<Self, ScriptError> {
        let tokens = Lexer::new(source, filename).tokenize()?;
        let body = Parser::new(tokens, filename).parse_module()?;
        Ok(Self {
            filename: filename.to_owned(),
            body,
        })
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Runs the script with `ns` as its globals.
    pub fn exec(&self, runtime: &Runtime, ns: &mut Namespace) -> Result<(), Exception> {
        let mut eval = Evaluator::new(runtime);
        eval.exec_block(&self.body, ns, None, &self.filename, "<module>")?;
        Ok(())
    }
}

impl FunctionDef {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// The function body as a script of its own, for running a function's
    /// code in another interpreter's `__main__`.
    ///
    /// Returns `None` when the function takes parameters.
    #[must_use]
    pub fn body_script(&self) -> Option<Script> {
        self.params.is_empty().then(|| Script {
            filename: self.filename.clone(),
            body: self.body.clone(),
        })
    }
}

/// Calls `callable` with `globals` as the namespace names resolve against.
pub fn call_value(
    runtime: &Runtime,
    callable: &Value,
    args: &[Value],
    kwargs: &IndexMap<String, Value>,
    globals: &Namespace,
) -> Result<Value, Exception> {
    Evaluator::new(runtime).call(callable, args, kwargs, globals)
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Equal,
    Minus,
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: u32,
}

struct Lexer<'src> {
    chars: std::iter::Peekable<std::str::Chars<'src>>,
    filename: &'src str,
    line: u32,
    /// Open brackets; newlines inside them are insignificant.
    depth: usize,
}

impl<'src> Lexer<'src> {
    fn new(source: &'src str, filename: &'src str) -> Self {
        Self {
            chars: source.chars().peekable(),
            filename,
            line: 1,
            depth: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError {
            message: message.into(),
            filename: self.filename.to_owned(),
            line: self.line,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ScriptError> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            let line = self.line;
            let tok = match c {
                '\n' => {
                    self.chars.next();
                    self.line += 1;
                    let at_line_start = matches!(tokens.last(), None | Some(Token { tok: Tok::Newline, .. }));
                    if self.depth > 0 || at_line_start {
                        continue;
                    }
                    Tok::Newline
                }
                ' ' | '\t' | '\r' => {
                    self.chars.next();
                    continue;
                }
                '#' => {
                    while self.chars.next_if(|&c| c != '\n').is_some() {}
                    continue;
                }
                '\'' | '"' => Tok::Str(self.string()?),
                'b' if self.is_bytes_prefix() => {
                    self.chars.next();
                    let s = self.string()?;
                    if !s.is_ascii() {
                        return Err(self.error("bytes can only contain ASCII literal characters"));
                    }
                    Tok::Bytes(s.into_bytes())
                }
                c if c.is_ascii_digit() => self.number()?,
                c if c == '_' || c.is_alphabetic() => {
                    let mut name = String::new();
                    while let Some(c) = self.chars.next_if(|&c| c == '_' || c.is_alphanumeric()) {
                        name.push(c);
                    }
                    Tok::Name(name)
                }
                _ => {
                    self.chars.next();
                    match c {
                        '(' | '[' | '{' => {
                            self.depth += 1;
                            match c {
                                '(' => Tok::LParen,
                                '[' => Tok::LBracket,
                                _ => Tok::LBrace,
                            }
                        }
                        ')' | ']' | '}' => {
                            self.depth = self.depth.saturating_sub(1);
                            match c {
                                ')' => Tok::RParen,
                                ']' => Tok::RBracket,
                                _ => Tok::RBrace,
                            }
                        }
                        ',' => Tok::Comma,
                        ':' => Tok::Colon,
                        ';' => Tok::Semi,
                        '=' => Tok::Equal,
                        '-' => Tok::Minus,
                        other => return Err(self.error(format!("invalid character '{other}'"))),
                    }
                }
            };
            tokens.push(Token { tok, line });
        }
        if !matches!(tokens.last(), None | Some(Token { tok: Tok::Newline, .. })) {
            tokens.push(Token {
                tok: Tok::Newline,
                line: self.line,
            });
        }
        tokens.push(Token {
            tok: Tok::Eof,
            line: self.line,
        });
        Ok(tokens)
    }

    fn is_bytes_prefix(&self) -> bool {
        let mut ahead = self.chars.clone();
        ahead.next();
        matches!(ahead.next(), Some('\'' | '"'))
    }

    fn string(&mut self) -> Result<String, ScriptError> {
        let Some(quote) = self.chars.next() else {
            return Err(self.error("unexpected end of input"));
        };
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None | Some('\n') => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('0') => out.push('\0'),
                    Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Tok, ScriptError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.chars.next_if(|&c| c.is_ascii_digit() || c == '_' || c == '.') {
            if c == '.' {
                is_float = true;
            }
            if c != '_' {
                text.push(c);
            }
        }
        if is_float {
            text.parse()
                .map(Tok::Float)
                .map_err(|_| self.error(format!("invalid decimal literal '{text}'")))
        } else {
            text.parse()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("integer literal too large '{text}'")))
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    filename: &'a str,
    /// Enclosing function names, for qualnames and `return` checks.
    scopes: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, filename: &'a str) -> Self {
        Self {
            tokens,
            pos: 0,
            filename,
            scopes: Vec::new(),
        }
    }

    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).map_or(&Tok::Eof, |t| &t.tok)
    }

    fn peek_second(&self) -> &Tok {
        self.tokens.get(self.pos + 1).map_or(&Tok::Eof, |t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ScriptError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError {
            message: message.into(),
            filename: self.filename.to_owned(),
            line: self.line(),
        }
    }

    fn name(&mut self) -> Result<String, ScriptError> {
        match self.advance() {
            Tok::Name(name) => Ok(name),
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn parse_module(mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut body = Vec::new();
        while !self.eat(&Tok::Eof) {
            self.simple_stmts(&mut body)?;
        }
        Ok(body)
    }

    /// `stmt (';' stmt)* [';'] NEWLINE`
    fn simple_stmts(&mut self, out: &mut Vec<Stmt>) -> Result<(), ScriptError> {
        loop {
            out.push(self.stmt()?);
            if self.eat(&Tok::Newline) {
                return Ok(());
            }
            self.expect(&Tok::Semi, "';' or end of line")?;
            if self.eat(&Tok::Newline) {
                return Ok(());
            }
        }
    }

    fn stmt(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let kind = match (self.peek(), self.peek_second()) {
            (Tok::Name(kw), _) if kw == "pass" => {
                self.advance();
                StmtKind::Pass
            }
            (Tok::Name(kw), _) if kw == "del" => {
                self.advance();
                StmtKind::Delete(self.name()?)
            }
            (Tok::Name(kw), _) if kw == "raise" => {
                self.advance();
                self.raise()?
            }
            (Tok::Name(kw), _) if kw == "return" => {
                self.advance();
                if self.scopes.is_empty() {
                    return Err(self.error("'return' outside function"));
                }
                let value = match self.peek() {
                    Tok::Semi | Tok::Newline | Tok::Eof => None,
                    _ => Some(self.expr()?),
                };
                StmtKind::Return(value)
            }
            (Tok::Name(kw), _) if kw == "def" => {
                self.advance();
                StmtKind::Def(Box::new(self.def(line)?))
            }
            (Tok::Name(_), Tok::Equal) => {
                let target = self.name()?;
                if is_keyword(&target) {
                    return Err(self.error(format!("cannot assign to {target}")));
                }
                self.advance();
                StmtKind::Assign(target, self.expr()?)
            }
            _ => StmtKind::Expr(self.expr()?),
        };
        Ok(Stmt { line, kind })
    }

    fn raise(&mut self) -> Result<StmtKind, ScriptError> {
        let type_name = self.name()?;
        let exc_type: ExcType = type_name
            .parse()
            .map_err(|_| self.error(format!("unknown exception type '{type_name}'")))?;
        let mut message = None;
        if self.eat(&Tok::LParen) && !self.eat(&Tok::RParen) {
            message = Some(self.expr()?);
            self.expect(&Tok::RParen, "')'")?;
        }
        Ok(StmtKind::Raise(exc_type, message))
    }

    fn def(&mut self, line: u32) -> Result<FunctionDef, ScriptError> {
        let name = self.name()?;
        let qualname = match self.scopes.last() {
            Some(outer) => format!("{outer}.<locals>.{name}"),
            None => name.clone(),
        };
        self.expect(&Tok::LParen, "'('")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.eat(&Tok::RParen) {
            let param = self.name()?;
            let default = if self.eat(&Tok::Equal) {
                Some(self.expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                None
            };
            params.push(Param { name: param, default });
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RParen, "')'")?;
                break;
            }
        }
        self.expect(&Tok::Colon, "':'")?;
        self.scopes.push(qualname.clone());
        let mut body = Vec::new();
        let parsed = self.simple_stmts(&mut body);
        self.scopes.pop();
        parsed?;
        // the body's newline ends the def as well
        self.pos -= 1;
        Ok(FunctionDef {
            name,
            qualname,
            filename: self.filename.to_owned(),
            line,
            params,
            body,
        })
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;
        while self.eat(&Tok::LParen) {
            let mut args = Vec::new();
            let mut kwargs = Vec::new();
            while !self.eat(&Tok::RParen) {
                if let (Tok::Name(_), Tok::Equal) = (self.peek(), self.peek_second()) {
                    let key = self.name()?;
                    self.advance();
                    kwargs.push((key, self.expr()?));
                } else if kwargs.is_empty() {
                    args.push(self.expr()?);
                } else {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                if !self.eat(&Tok::Comma) {
                    self.expect(&Tok::RParen, "')'")?;
                    break;
                }
            }
            expr = Expr::Call {
                func: Box::new(expr),
                args,
                kwargs,
            };
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        Ok(match self.advance() {
            Tok::Int(i) => Expr::Int(i),
            Tok::Float(f) => Expr::Float(f),
            Tok::Minus => match self.advance() {
                Tok::Int(i) => Expr::Int(-i),
                Tok::Float(f) => Expr::Float(-f),
                _ => return Err(self.error("invalid syntax")),
            },
            Tok::Str(s) => Expr::Str(s),
            Tok::Bytes(b) => Expr::Bytes(b),
            Tok::Name(name) => match name.as_str() {
                "None" => Expr::None,
                "True" => Expr::Bool(true),
                "False" => Expr::Bool(false),
                _ if is_keyword(&name) => return Err(self.error("invalid syntax")),
                _ => Expr::Name(name.clone()),
            },
            Tok::LParen => {
                if self.eat(&Tok::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.eat(&Tok::RParen) {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat(&Tok::Comma) {
                    if self.peek() == &Tok::RParen {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect(&Tok::RParen, "')'")?;
                Expr::Tuple(items)
            }
            Tok::LBracket => Expr::List(self.sequence(&Tok::RBracket, "']'")?),
            Tok::LBrace => {
                let mut items = Vec::new();
                while !self.eat(&Tok::RBrace) {
                    let key = self.expr()?;
                    self.expect(&Tok::Colon, "':'")?;
                    items.push((key, self.expr()?));
                    if !self.eat(&Tok::Comma) {
                        self.expect(&Tok::RBrace, "'}'")?;
                        break;
                    }
                }
                Expr::Dict(items)
            }
            _ => return Err(self.error("invalid syntax")),
        })
    }

    fn sequence(&mut self, close: &Tok, what: &str) -> Result<Vec<Expr>, ScriptError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.expr()?);
            if !self.eat(&Tok::Comma) {
                self.expect(close, what)?;
                break;
            }
        }
        Ok(items)
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "None" | "True" | "False" | "def" | "del" | "pass" | "raise" | "return"
    )
}

// ============================================================================
// Evaluator
// ============================================================================

enum Flow {
    Next,
    Return(Value),
}

struct Evaluator<'r> {
    runtime: &'r Runtime,
    depth: usize,
}

impl<'r> Evaluator<'r> {
    fn new(runtime: &'r Runtime) -> Self {
        Self { runtime, depth: 0 }
    }

    /// Runs `body` binding into `locals`. Names not found in `locals` are
    /// looked up in `globals`, then among the runtime's native functions.
    fn exec_block(
        &mut self,
        body: &[Stmt],
        locals: &mut Namespace,
        globals: Option<&Namespace>,
        filename: &str,
        scope: &str,
    ) -> Result<Flow, Exception> {
        for stmt in body {
            let flow = self.exec_stmt(stmt, locals, globals).map_err(|mut exc| {
                exc.push_frame(Frame {
                    filename: filename.to_owned(),
                    line: stmt.line,
                    name: scope.to_owned(),
                });
                exc
            })?;
            if let Flow::Return(value) = flow {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, locals: &mut Namespace, globals: Option<&Namespace>) -> Result<Flow, Exception> {
        match &stmt.kind {
            StmtKind::Pass => {}
            StmtKind::Assign(name, expr) => {
                let value = self.eval(expr, locals, globals)?;
                locals.insert(name.clone(), value);
            }
            StmtKind::Delete(name) => {
                if locals.shift_remove(name).is_none() {
                    return Err(Exception::new(
                        ExcType::NameError,
                        format!("name '{name}' is not defined"),
                    ));
                }
            }
            StmtKind::Raise(exc_type, message) => {
                let exc = match message {
                    None => Exception::bare(*exc_type),
                    Some(expr) => match self.eval(expr, locals, globals)? {
                        Value::Str(msg) => Exception::new(*exc_type, msg),
                        other => Exception::new(*exc_type, other.repr()),
                    },
                };
                return Err(exc);
            }
            StmtKind::Def(def) => {
                locals.insert(
                    def.name.clone(),
                    Value::Function(Function::Defined(Arc::new((**def).clone()))),
                );
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, locals, globals)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Expr(expr) => {
                self.eval(expr, locals, globals)?;
            }
        }
        Ok(Flow::Next)
    }

    fn eval(&mut self, expr: &Expr, locals: &Namespace, globals: Option<&Namespace>) -> Result<Value, Exception> {
        Ok(match expr {
            Expr::None => Value::None,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Int(i) => Value::Int(*i),
            Expr::Float(f) => Value::Float(*f),
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Bytes(b) => Value::Bytes(b.clone()),
            Expr::Name(name) => self.lookup(name, locals, globals)?,
            Expr::Tuple(items) => Value::Tuple(self.eval_all(items, locals, globals)?),
            Expr::List(items) => Value::List(self.eval_all(items, locals, globals)?),
            Expr::Dict(items) => {
                let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(items.len());
                for (k, v) in items {
                    let key = self.eval(k, locals, globals)?;
                    let value = self.eval(v, locals, globals)?;
                    match pairs.iter_mut().find(|(existing, _)| *existing == key) {
                        Some(slot) => slot.1 = value,
                        None => pairs.push((key, value)),
                    }
                }
                Value::Dict(pairs)
            }
            Expr::Call { func, args, kwargs } => {
                let callable = self.eval(func, locals, globals)?;
                let args = self.eval_all(args, locals, globals)?;
                let mut kw = IndexMap::with_capacity(kwargs.len());
                for (key, expr) in kwargs {
                    let value = self.eval(expr, locals, globals)?;
                    if kw.insert(key.clone(), value).is_some() {
                        return Err(Exception::new(
                            ExcType::SyntaxError,
                            format!("keyword argument repeated: {key}"),
                        ));
                    }
                }
                self.call(&callable, &args, &kw, globals.unwrap_or(locals))?
            }
        })
    }

    fn eval_all(&mut self, items: &[Expr], locals: &Namespace, globals: Option<&Namespace>) -> Result<Vec<Value>, Exception> {
        items.iter().map(|item| self.eval(item, locals, globals)).collect()
    }

    fn lookup(&self, name: &str, locals: &Namespace, globals: Option<&Namespace>) -> Result<Value, Exception> {
        if let Some(value) = locals.get(name).or_else(|| globals.and_then(|g| g.get(name))) {
            return Ok(value.clone());
        }
        if self.runtime.native(name).is_some() {
            return Ok(Value::Function(Function::Native(name.to_owned())));
        }
        Err(Exception::new(
            ExcType::NameError,
            format!("name '{name}' is not defined"),
        ))
    }

    fn call(
        &mut self,
        callable: &Value,
        args: &[Value],
        kwargs: &IndexMap<String, Value>,
        globals: &Namespace,
    ) -> Result<Value, Exception> {
        match callable {
            Value::Function(Function::Native(qualname)) => {
                let native = self.runtime.native(qualname).ok_or_else(|| {
                    Exception::new(
                        ExcType::NameError,
                        format!("native function '{qualname}' is not registered"),
                    )
                })?;
                native(args, kwargs)
            }
            Value::Function(Function::Defined(def)) => {
                if self.depth >= MAX_DEPTH {
                    return Err(Exception::new(
                        ExcType::RecursionError,
                        "maximum recursion depth exceeded",
                    ));
                }
                let mut frame = bind_args(def, args, kwargs, |expr| self.eval(expr, globals, None))?;
                self.depth += 1;
                let flow = self.exec_block(&def.body, &mut frame, Some(globals), &def.filename, &def.name);
                self.depth -= 1;
                match flow? {
                    Flow::Return(value) => Ok(value),
                    Flow::Next => Ok(Value::None),
                }
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }
}

fn bind_args(
    def: &FunctionDef,
    args: &[Value],
    kwargs: &IndexMap<String, Value>,
    mut eval_default: impl FnMut(&Expr) -> Result<Value, Exception>,
) -> Result<Namespace, Exception> {
    let name = &def.name;
    if args.len() > def.params.len() {
        return Err(Exception::type_error(format!(
            "{name}() takes {} positional argument{} but {} were given",
            def.params.len(),
            if def.params.len() == 1 { "" } else { "s" },
            args.len()
        )));
    }
    if let Some(unknown) = kwargs.keys().find(|key| def.params.iter().all(|p| &p.name != *key)) {
        return Err(Exception::type_error(format!(
            "{name}() got an unexpected keyword argument '{unknown}'"
        )));
    }
    let mut frame = Namespace::with_capacity(def.params.len());
    let mut missing = Vec::new();
    for (i, param) in def.params.iter().enumerate() {
        let positional = args.get(i).cloned();
        let keyword = kwargs.get(&param.name).cloned();
        let value = match (positional, keyword) {
            (Some(_), Some(_)) => {
                return Err(Exception::type_error(format!(
                    "{name}() got multiple values for argument '{}'",
                    param.name
                )));
            }
            (Some(value), None) | (None, Some(value)) => value,
            (None, None) => match &param.default {
                Some(expr) => eval_default(expr)?,
                None => {
                    missing.push(format!("'{}'", param.name));
                    continue;
                }
            },
        };
        frame.insert(param.name.clone(), value);
    }
    if !missing.is_empty() {
        return Err(Exception::type_error(format!(
            "{name}() missing {} required positional argument{}: {}",
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            missing.join(" and ")
        )));
    }
    Ok(frame)
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<script {} ({} statements)>", self.filename, self.body.len())
    }
}
