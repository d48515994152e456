use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = lexiconforge_import::cli::Cli::parse();
    lexiconforge_import::logging::init(cli.verbose, cli.quiet).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        lexiconforge_import::cli::Command::Import(args) => {
            lexiconforge_import::commands::import(args)
                .await
                .context("import")?;
        }
        lexiconforge_import::cli::Command::ImportFile(args) => {
            lexiconforge_import::commands::import_file(args)
                .await
                .context("import-file")?;
        }
        lexiconforge_import::cli::Command::Chapters(args) => {
            lexiconforge_import::commands::chapters(args)
                .await
                .context("chapters")?;
        }
    }

    Ok(())
}
