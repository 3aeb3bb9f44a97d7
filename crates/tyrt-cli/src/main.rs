use std::{env, fs, process::ExitCode, time::Instant};

use tyrt::{InterpreterConfig, Runtime};

const USAGE: &str = "usage: tyrt [--config isolated|legacy|empty] [-v] [script]";

struct Args {
    file: String,
    config: Option<String>,
    verbose: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Self {
            file: "example.py".to_owned(),
            config: None,
            verbose: false,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-v" | "--verbose" => parsed.verbose = true,
                "--config" => parsed.config = Some(args.next().ok_or("--config needs a value")?),
                "-h" | "--help" => return Err(USAGE.to_owned()),
                flag if flag.starts_with('-') => return Err(format!("unknown option {flag}\n{USAGE}")),
                _ => parsed.file = arg,
            }
        }
        Ok(parsed)
    }
}

fn main() -> ExitCode {
    let args = match Args::parse(env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG overrides -v
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_module("tyrt", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let code = match read_file(&args.file) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let config = match InterpreterConfig::named(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = Runtime::new();
    let mut ctx = runtime.thread();
    let id = match ctx.create(Some(config), false) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("running {} in interpreter {id}", args.file);

    let start = Instant::now();
    let outcome = ctx.run_string(id, &code, None, false);
    let elapsed = start.elapsed();
    match outcome {
        Ok(None) => {
            if let Some(interp) = runtime.get(id) {
                for name in interp.global_names() {
                    if name.starts_with("__") {
                        continue;
                    }
                    if let Some(value) = interp.get_global(&name) {
                        println!("{name} = {}", value.repr());
                    }
                }
            }
            eprintln!("success after: {elapsed:?}");
            ExitCode::SUCCESS
        }
        Ok(Some(excinfo)) => {
            eprintln!("error after: {elapsed:?}\n{}", excinfo.errdisplay);
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error after: {elapsed:?}\n{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    log::debug!("reading file: {file_path}");
    match fs::metadata(file_path) {
        Ok(metadata) if !metadata.is_file() => return Err(format!("{file_path} is not a file")),
        Ok(_) => {}
        Err(err) => return Err(format!("reading {file_path}: {err}")),
    }
    fs::read_to_string(file_path).map_err(|err| format!("reading {file_path}: {err}"))
}
