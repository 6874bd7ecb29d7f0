use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use chatvault_cli::{Config, DownloadStart, Orchestrator, UploadRequest};
use chatvault_notify::format_size;
use chatvault_transport::{BotApiMessenger, BotApiTransport, Credential, Messenger, Transport};
use chatvault_types::{ErrorKind, VaultError};

#[derive(Parser)]
#[command(
    name = "chatvault",
    about = "Store files as chunked documents in a messaging channel",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file; large files are split into chunks.
    Upload {
        source: PathBuf,
        /// Encrypt the payload before upload with this password.
        #[arg(long)]
        encrypt_password: Option<String>,
    },
    /// Download a stored file into a directory.
    Download {
        file_id: String,
        dest_dir: PathBuf,
        /// Password for encrypted payloads.
        #[arg(long)]
        password: Option<String>,
    },
    /// Resume an interrupted upload.
    ResumeUpload { file_id: String, source: PathBuf },
    /// Resume an interrupted download.
    ResumeDownload {
        download_id: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Pause a running transfer, keeping its progress.
    Pause { operation_id: String },
    /// Stop a running transfer (pause with an explicit checkpoint).
    Stop { operation_id: String },
    /// Cancel a transfer and discard its records.
    Cancel { operation_id: String },
    /// List stored files and any incomplete transfers.
    List,
    /// Delete a stored file.
    Delete {
        file_id: String,
        /// Also delete the stored messages on the remote side.
        #[arg(long)]
        remote: bool,
    },
    /// Write a portable .link descriptor for one or more files.
    Share {
        out_path: PathBuf,
        #[arg(long)]
        password: String,
        #[arg(required = true)]
        file_ids: Vec<String>,
    },
    /// Import a .link descriptor and optionally download its files.
    ImportShare {
        link_path: PathBuf,
        #[arg(long)]
        password: String,
        /// Download the shared files into this directory.
        #[arg(long)]
        dest_dir: Option<PathBuf>,
        /// Password for encrypted payloads inside the share.
        #[arg(long)]
        file_password: Option<String>,
    },
    /// Write an encrypted backup of the catalog.
    Backup {
        out_path: PathBuf,
        #[arg(long)]
        password: String,
    },
    /// Restore a catalog backup (the destination must not exist).
    Restore {
        backup_path: PathBuf,
        dest: PathBuf,
        #[arg(long)]
        password: String,
    },
}

fn exit_code_for(error: &VaultError) -> u8 {
    match error.kind() {
        ErrorKind::BadPassword => 3,
        ErrorKind::Network
        | ErrorKind::Timeout
        | ErrorKind::RateLimited
        | ErrorKind::Auth
        | ErrorKind::RemoteRejected => 4,
        ErrorKind::Corrupt | ErrorKind::IntegrityFailure | ErrorKind::SourceMismatch => 5,
        ErrorKind::Canceled => 6,
        _ => 7,
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatvault=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: Cli) -> Result<(), VaultError> {
    // Restore runs before the catalog can be opened.
    if let Command::Restore {
        backup_path,
        dest,
        password,
    } = &cli.command
    {
        return Orchestrator::restore_catalog(backup_path, dest, password);
    }

    let config = Config::from_env()?;
    let transport: Arc<dyn Transport> = Arc::new(
        BotApiTransport::new().map_err(VaultError::from)?,
    );
    let messenger: Option<Arc<dyn Messenger>> = config.credentials.first().map(|token| {
        BotApiMessenger::new(Credential::new(token.clone()), config.chat_id.clone())
            .map(|m| Arc::new(m) as Arc<dyn Messenger>)
    })
    .transpose()
    .map_err(VaultError::from)?;

    let orchestrator = Orchestrator::init(&config, transport, messenger)?;
    let result = dispatch(&orchestrator, cli.command);
    orchestrator.shutdown();
    result
}

fn dispatch(orchestrator: &Orchestrator, command: Command) -> Result<(), VaultError> {
    match command {
        Command::Upload {
            source,
            encrypt_password,
        } => {
            let file_id = orchestrator.upload(&source, &UploadRequest { encrypt_password })?;
            // Chunked uploads run on a supervisor; wait so the CLI exits
            // with the transfer's real outcome.
            match orchestrator.wait(&file_id) {
                Ok(outcome) => println!("{file_id} ({outcome:?})"),
                Err(VaultError::NotFound(_)) => println!("{file_id} (Completed)"),
                Err(e) => return Err(e),
            }
            Ok(())
        }
        Command::Download {
            file_id,
            dest_dir,
            password,
        } => {
            match orchestrator.download(&file_id, &dest_dir, password)? {
                DownloadStart::Direct(path) => println!("{}", path.display()),
                DownloadStart::Chunked { download_id } => {
                    let outcome = orchestrator.wait(&download_id)?;
                    println!("{download_id} ({outcome:?})");
                }
            }
            Ok(())
        }
        Command::ResumeUpload { file_id, source } => {
            let file_id = orchestrator.resume_upload(&file_id, &source)?;
            let outcome = orchestrator.wait(&file_id)?;
            println!("{file_id} ({outcome:?})");
            Ok(())
        }
        Command::ResumeDownload {
            download_id,
            password,
        } => {
            let download_id = orchestrator.resume_download(&download_id, password)?;
            let outcome = orchestrator.wait(&download_id)?;
            println!("{download_id} ({outcome:?})");
            Ok(())
        }
        Command::Pause { operation_id } => orchestrator.pause(&operation_id),
        Command::Stop { operation_id } => orchestrator.stop(&operation_id),
        Command::Cancel { operation_id } => {
            orchestrator.cancel(&operation_id)?;
            // A live run ends in Canceled; surface success to the user.
            match orchestrator.wait(&operation_id) {
                Ok(_) | Err(VaultError::Canceled) | Err(VaultError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Command::List => {
            let stats = orchestrator.stats()?;
            println!(
                "{} file(s), {} stored",
                stats.total_files,
                format_size(stats.total_bytes)
            );
            for file in orchestrator.list_files()? {
                println!(
                    "{}  {:>10}  {:<8}  {}",
                    file.file_id,
                    format_size(file.size),
                    file.category.as_str(),
                    file.name
                );
            }
            for upload in orchestrator.list_incomplete_uploads()? {
                println!(
                    "incomplete upload {}  {}/{} chunks  {}",
                    upload.file_id,
                    upload.completed_chunks,
                    upload.total_chunks,
                    upload.state.as_str()
                );
            }
            for download in orchestrator.list_incomplete_downloads()? {
                println!(
                    "incomplete download {}  {}/{} chunks  {}",
                    download.download_id,
                    download.completed_chunks,
                    download.total_chunks,
                    download.state.as_str()
                );
            }
            Ok(())
        }
        Command::Delete { file_id, remote } => orchestrator.delete_file(&file_id, remote),
        Command::Share {
            out_path,
            password,
            file_ids,
        } => {
            let path = orchestrator.share(&file_ids, &password, &out_path)?;
            println!("{}", path.display());
            Ok(())
        }
        Command::ImportShare {
            link_path,
            password,
            dest_dir,
            file_password,
        } => {
            let descriptor = orchestrator.import_share(&link_path, &password)?;
            println!(
                "{} file(s) in share:",
                descriptor.files.len()
            );
            for file in &descriptor.files {
                println!(
                    "  {}  {:>10}  {}",
                    file.file_name,
                    format_size(file.size),
                    file.category.as_str()
                );
            }
            if let Some(dest_dir) = dest_dir {
                for start in orchestrator.download_share(&descriptor, &dest_dir, file_password)? {
                    match start {
                        DownloadStart::Direct(path) => println!("{}", path.display()),
                        DownloadStart::Chunked { download_id } => {
                            let outcome = orchestrator.wait(&download_id)?;
                            println!("{download_id} ({outcome:?})");
                        }
                    }
                }
            }
            Ok(())
        }
        Command::Backup { out_path, password } => orchestrator.backup_catalog(&out_path, &password),
        Command::Restore { .. } => unreachable!("handled before init"),
    }
}
