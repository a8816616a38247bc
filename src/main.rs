use bodega_sync_lib::cli::{Cli, CliHandler, Commands};
use clap::Parser;

#[tokio::main]
async fn main() {
    bodega_sync_lib::init_environment();
    let cli = Cli::parse();

    let db = match bodega_sync_lib::open_database(cli.data_dir) {
        Ok(db) => db,
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let manager = match bodega_sync_lib::open_manager(db) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("FATAL: Failed to start sync engine: {}", e);
            std::process::exit(1);
        }
    };

    let command = cli.command.unwrap_or(Commands::Run);
    if let Err(e) = CliHandler::new(manager).handle(command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
