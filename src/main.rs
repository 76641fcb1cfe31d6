use eyre::Result;

use nscan::cli::{Command, OutputArgs, ScanArgs};
use nscan::{Config, NmapScanner, Scanner, Session, SessionStore, TargetScope, parse_report_file, pretty};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = nscan::cli::parse();

    // Initialize logging first
    if let Err(e) = nscan::init_logging(cli.verbose) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    // Divider to separate runs in the log file
    log::info!("================================================================================");
    log::info!("🚀 NSCAN {} STARTING", env!("CARGO_PKG_VERSION"));
    log::info!("================================================================================");

    let config = Config::from_cli(&cli)?;

    match cli.command {
        Command::Scan(args) => run_scan(&config, &args).await,
        Command::Parse { xml, output } => {
            let report = parse_report_file(&xml)?;
            pretty::print_report(&report);
            let session = Session::from_report(report, output.name.clone());
            write_outputs(&config, &session, &output)
        }
        Command::Export { session, csv } => {
            let rows = Session::load_json(&session)?.export_csv(&csv)?;
            println!("Wrote {} rows to {}", rows, csv.display());
            Ok(())
        }
        Command::Import { csv, json } => {
            let session = Session::import_csv(&csv)?;
            session.save_json(&json)?;
            println!("Imported {} hosts into {}", session.hosts().len(), json.display());
            Ok(())
        }
        Command::Show { session } => {
            pretty::print_session(&Session::load_json(&session)?);
            Ok(())
        }
        Command::Sessions => {
            let store = SessionStore::new(&config.session_dir);
            pretty::print_session_list(&store.list()?);
            Ok(())
        }
        Command::Targets { file } => {
            pretty::print_scope(&TargetScope::from_file(&file)?);
            Ok(())
        }
    }
}

async fn run_scan(config: &Config, args: &ScanArgs) -> Result<()> {
    let request = args.request()?;
    let scanner = NmapScanner::locate(config.nmap_path.as_deref(), args.timeout())?;

    match scanner.version().await {
        Ok(version) => log::info!("[main] scanner: path={} version={}", scanner.executable().display(), version),
        Err(e) => log::warn!("[main] scanner_version_unknown: {:#}", e),
    }

    println!("Scanning {}", request.scope.display_name());

    let mut session = Session::new(args.output.name.clone()).with_max_records(config.max_records);
    let outcome = scanner.run(&request, &mut session).await;

    pretty::print_session(&session);

    // Failed runs are still written so the error is kept with the session
    write_outputs(config, &session, &args.output)?;
    outcome
}

fn write_outputs(config: &Config, session: &Session, output: &OutputArgs) -> Result<()> {
    if let Some(path) = &output.json {
        session.save_json(path)?;
        println!("Saved session to {}", path.display());
    }
    if let Some(path) = &output.csv {
        let rows = session.export_csv(path)?;
        println!("Wrote {} rows to {}", rows, path.display());
    }
    if output.save {
        let path = SessionStore::new(&config.session_dir).save(session)?;
        println!("Saved session {} to {}", session.id, path.display());
    }
    Ok(())
}
