//! `isoscope` command line: list the built-in scenarios or run them against a
//! database and print every step as it happens.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::{Arg, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

use isoscope::prelude::*;

const EXIT_PASS: i32 = 0;
const EXIT_FAIL: i32 = 1;
const EXIT_ERROR: i32 = 2;

fn build_cli() -> Command {
    Command::new("isoscope")
        .about("Demonstrates and asserts transaction isolation anomalies")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_parser(clap::value_parser!(PathBuf))
                .help("TOML configuration file")
                .global(true),
        )
        .subcommand(Command::new("list").about("List the built-in scenarios"))
        .subcommand(
            Command::new("run")
                .about("Run one scenario, or all of them")
                .arg(
                    Arg::new("scenario")
                        .required(true)
                        .help("Scenario name as printed by `list`, or `all`"),
                )
                .arg(
                    Arg::new("isolation")
                        .long("isolation")
                        .short('i')
                        .help("Run the script under this level instead (e.g. repeatable-read)"),
                ),
        )
}

fn main() {
    init_logging();
    let matches = build_cli().get_matches();

    let code = match matches.subcommand() {
        Some(("list", _)) => {
            list();
            EXIT_PASS
        }
        Some(("run", sub)) => match run(&matches, sub) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {}", e);
                EXIT_ERROR
            }
        },
        _ => EXIT_ERROR,
    };
    process::exit(code);
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ISOSCOPE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    // Bridges `log` records from the library as well.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn list() {
    let fixture = Fixture::default();
    for kind in ScenarioKind::ALL {
        let probes = match kind.build(&fixture, ExpectedFailure::Serialization) {
            Ok(scenario) => scenario
                .probes()
                .iter()
                .map(|probe| probe.class.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            Err(e) => format!("invalid: {}", e),
        };
        println!("{:<20} {:<17} {}", kind.name(), kind.isolation().as_sql(), probes);
    }
}

fn run(matches: &ArgMatches, sub: &ArgMatches) -> Result<i32> {
    let path = sub
        .get_one::<PathBuf>("config")
        .or_else(|| matches.get_one::<PathBuf>("config"));
    let config = HarnessConfig::load(path.map(PathBuf::as_path))?;
    let isolation = sub
        .get_one::<String>("isolation")
        .map(|level| level.parse::<TransactionIsolation>())
        .transpose()?;
    let kinds = match sub.get_one::<String>("scenario").map(String::as_str) {
        Some("all") | None => ScenarioKind::ALL.to_vec(),
        Some(name) => vec![name.parse::<ScenarioKind>()?],
    };

    let harness = Harness::new(connector(&config)?, config.scheduler())
        .with_fixture(config.fixture())
        .with_serialization_failure(config.engine.serialization_failure);

    let mut code = EXIT_PASS;
    for kind in kinds {
        let scenario = harness.scenario(kind, isolation)?;
        println!("== {} ({}) ==", scenario.name(), scenario.isolation());
        match run_printed(&harness, &scenario) {
            Ok(verdict) => {
                println!("{}", verdict);
                if !verdict.passed() {
                    code = code.max(EXIT_FAIL);
                }
            }
            Err(e) => {
                report_abort(&e);
                code = EXIT_ERROR;
            }
        }
    }
    Ok(code)
}

/// Runs `scenario`, printing each observation as the log records it.
fn run_printed(harness: &Harness, scenario: &Scenario) -> Result<Verdict> {
    let (tx, rx) = crossbeam_channel::unbounded::<Observation>();
    let printer = thread::spawn(move || {
        for observation in rx {
            println!("{}", observation);
        }
    });
    let log = ObservationLog::with_listener(tx);
    let result = harness.run_with_log(scenario, &log);
    // Dropping the log disconnects the listener and lets the printer finish.
    drop(log);
    if printer.join().is_err() {
        eprintln!("output thread panicked");
    }
    result.map(|(_, verdict)| verdict)
}

fn report_abort(err: &HarnessError) {
    match err {
        HarnessError::Scenario(failure) => {
            let at = failure
                .step
                .as_ref()
                .map(|step| format!(" at step {}", step))
                .unwrap_or_default();
            println!("ERROR {}{}: {}", failure.scenario, at, failure.cause);
        }
        other => println!("ERROR {}", other),
    }
}

#[cfg(feature = "mysql")]
fn connector(config: &HarnessConfig) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(MySqlConnector::from_config(config)))
}

#[cfg(not(feature = "mysql"))]
fn connector(_config: &HarnessConfig) -> Result<Arc<dyn Connector>> {
    Err(HarnessError::Config(
        "built without a database backend; enable the `mysql` feature".to_string(),
    ))
}
