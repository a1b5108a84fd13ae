use std::{
    env, fs,
    io::{self, Write},
    path::PathBuf,
    process, thread, time,
};

use cosignerd::{
    commands::{CommandError, CosignerControl},
    config::Config,
    locks::EntityId,
    setup_panic_hook, VERSION,
};

use serde_json::Value as Json;

fn print_help_exit() {
    eprintln!("cosigner-cli {}", VERSION);
    eprintln!("Usage:");
    eprintln!(" cosigner-cli [--conf <config file path>] <command> [<param 1> <param 2> ...]");
    eprintln!("Commands:");
    eprintln!(" importkey <label> <xprv or xpub>");
    eprintln!(" importmnemonic <label> <word 1> ... <word N>");
    eprintln!(" importwallet <wallet JSON file>");
    eprintln!(" importpsbt <PSBT file> [<name>]");
    eprintln!(" updatepsbt <name> <PSBT file>");
    eprintln!(" sign <key label> <wallet name> <PSBT name>");
    eprintln!(" delete <key|wallet|psbt> <name>");
    eprintln!(" list");
    eprintln!(" printpsbt <PSBT name> <wallet name>");
    eprintln!(" exportpsbt <PSBT name>");
    eprintln!("By default the configuration is read from a 'cosigner.toml' file in the configuration directory, '~/.cosigner/' on Linux.");
    process::exit(1);
}

// Returns (Maybe(special conf file), Command name, List of parameters)
fn parse_args(mut args: Vec<String>) -> (Option<PathBuf>, String, Vec<String>) {
    if args.len() < 2 {
        eprintln!("Not enough arguments.");
        print_help_exit();
    }
    args.remove(0); // Program name

    let mut args = args.into_iter();
    let mut conf_file = None;
    loop {
        match args.next().as_deref() {
            Some("--conf") => match args.next() {
                Some(path) => conf_file = Some(PathBuf::from(path)),
                None => {
                    eprintln!("Not enough arguments.");
                    print_help_exit();
                }
            },
            Some("--help") | Some("-h") => print_help_exit(),
            Some(command) => return (conf_file, command.to_owned(), args.collect()),
            None => {
                eprintln!("No command given.");
                print_help_exit();
            }
        }
    }
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][thread {}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        eprintln!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                thread::current().name().unwrap_or("unnamed"),
                message
            ))
        })
        .level(log_level);

    // The result is printed on stdout.
    dispatcher.chain(std::io::stderr()).apply()?;

    Ok(())
}

enum CliError {
    Usage(String),
    Io(PathBuf, io::Error),
    Command(CommandError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Usage(e) => write!(f, "{}", e),
            Self::Io(path, e) => write!(f, "Error reading '{}': {}", path.display(), e),
            Self::Command(e) => write!(f, "{}", e),
        }
    }
}

impl From<CommandError> for CliError {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, CliError> {
    let path = PathBuf::from(path);
    fs::read(&path).map_err(|e| CliError::Io(path, e))
}

fn params_count(command: &str, params: &[String], min: usize, max: usize) -> Result<(), CliError> {
    if params.len() < min || params.len() > max {
        return Err(CliError::Usage(format!(
            "Invalid number of parameters for '{}'. Run with '--help' for usage.",
            command
        )));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: T) -> Json {
    serde_json::to_value(value).expect("Our results always serialize")
}

fn run(control: &CosignerControl, command: &str, params: &[String]) -> Result<Json, CliError> {
    Ok(match command {
        "importkey" => {
            params_count(command, params, 2, 2)?;
            to_json(control.import_key(&params[1], &params[0])?)
        }
        "importmnemonic" => {
            params_count(command, params, 2, usize::MAX)?;
            to_json(control.import_mnemonic(&params[1..].join(" "), &params[0])?)
        }
        "importwallet" => {
            params_count(command, params, 1, 1)?;
            let json = read_file(&params[0])?;
            let json = String::from_utf8_lossy(&json);
            to_json(control.import_wallet(&json)?)
        }
        "importpsbt" => {
            params_count(command, params, 1, 2)?;
            let data = read_file(&params[0])?;
            to_json(control.import_psbt(&data, params.get(1).map(|s| s.as_str()))?)
        }
        "updatepsbt" => {
            params_count(command, params, 2, 2)?;
            let data = read_file(&params[1])?;
            to_json(control.update_psbt(&params[0], &data)?)
        }
        "sign" => {
            params_count(command, params, 3, 3)?;
            to_json(control.sign(&params[0], &params[1], &params[2])?)
        }
        "delete" => {
            params_count(command, params, 2, 2)?;
            let name = params[1].clone();
            let id = match params[0].as_str() {
                "key" => EntityId::Key(name),
                "wallet" => EntityId::Wallet(name),
                "psbt" => EntityId::Psbt(name),
                kind => {
                    return Err(CliError::Usage(format!(
                        "Unknown kind of entity '{}'. Must be one of 'key', 'wallet' or 'psbt'.",
                        kind
                    )))
                }
            };
            to_json(control.delete(&id)?)
        }
        "list" => {
            params_count(command, params, 0, 0)?;
            to_json(control.list()?)
        }
        "printpsbt" => {
            params_count(command, params, 2, 2)?;
            let summary = control.print_psbt(&params[0], &params[1])?;
            eprintln!("{}", summary);
            to_json(summary)
        }
        "exportpsbt" => {
            params_count(command, params, 1, 1)?;
            Json::String(control.export_psbt(&params[0])?)
        }
        _ => {
            return Err(CliError::Usage(format!(
                "Unknown command '{}'. Run with '--help' for usage.",
                command
            )))
        }
    })
}

fn main() {
    let args = env::args().collect();
    let (conf_file, command, params) = parse_args(args);

    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        print_help_exit();
        unreachable!();
    });
    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });
    setup_panic_hook();

    let control = CosignerControl::from_config(&config).unwrap_or_else(|e| {
        log::error!("Error starting the cosigner: {}", e);
        process::exit(1);
    });

    let exit_code = match run(&control, &command, &params) {
        Ok(r) => {
            println!("{:#}", serde_json::json!({ "result": r }));
            0
        }
        Err(e) => {
            println!("{:#}", serde_json::json!({ "error": e.to_string() }));
            1
        }
    };
    io::stdout().flush().expect("Flushing stdout");
    process::exit(exit_code);
}
