use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use comprobante_core::certificate::CertificateCredential;
use comprobante_core::clave::{DocumentKey, IdentificationType, IssuerIdentification, Situation};
use comprobante_core::config::Config;
use comprobante_core::consecutive::{ConsecutiveAllocator, ConsecutiveNumber, DocumentType, Partition};
use comprobante_core::document::c14n::{canonicalize, canonicalize_fragment};
use comprobante_core::document::sign::DocumentSigner;
use comprobante_core::document::verify::verify;
use comprobante_core::document::xml::{parse_document, Document};
use comprobante_core::issue::{DocumentIssuer, IssueRequest};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod counter;

use counter::FileCounterStore;

const DEFAULT_PASSWORD_ENV: &str = "COMPROBANTE_P12_PASSWORD";

#[derive(Parser)]
#[command(name = "comprobante")]
#[command(version, about = "Costa Rican electronic document signing CLI")]
struct Cli {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "COMPROBANTE_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds a 50-digit clave
    Key {
        #[arg(long)]
        issuer_type: IdentificationType,
        #[arg(long)]
        issuer: String,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        terminal: String,
        #[arg(long)]
        doc_type: DocumentType,
        #[arg(long)]
        sequence: u64,
        /// Emission date (YYYY-MM-DD); today in Costa Rica when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "normal")]
        situation: Situation,
    },
    /// Prints the status of a PKCS#12 bundle as JSON
    CertStatus {
        #[arg(long)]
        p12: PathBuf,
        /// Environment variable holding the bundle password
        #[arg(long, default_value = DEFAULT_PASSWORD_ENV)]
        password_env: String,
    },
    /// Prints the canonical form of a document or of one fragment
    Canonicalize {
        #[arg(long)]
        document: PathBuf,
        #[arg(long)]
        fragment: Option<String>,
    },
    /// Allocates a consecutive number, writes the header and signs
    Sign {
        #[arg(long)]
        document: PathBuf,
        #[arg(long)]
        p12: PathBuf,
        #[arg(long, default_value = DEFAULT_PASSWORD_ENV)]
        password_env: String,
        #[arg(long)]
        issuer_type: IdentificationType,
        #[arg(long)]
        issuer: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        terminal: String,
        /// Document type code; taken from the root namespace when omitted
        #[arg(long)]
        doc_type: Option<DocumentType>,
        #[arg(long)]
        counter_file: PathBuf,
        #[arg(long, default_value = "normal")]
        situation: Situation,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output path; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verifies a signed document; exits with 1 when the signature is not valid
    Verify {
        #[arg(long)]
        document: PathBuf,
    },
}

#[derive(Serialize)]
struct IssueSummary<'a> {
    clave: &'a str,
    consecutive: String,
    signature_id: &'a str,
    out: &'a Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Key {
            issuer_type,
            issuer,
            branch,
            terminal,
            doc_type,
            sequence,
            date,
            situation,
        } => {
            let issuer = IssuerIdentification::new(issuer_type, &issuer)?;
            let consecutive: ConsecutiveNumber = format!("{branch}{terminal}{doc_type}{sequence:010}")
                .parse()
                .context("invalid consecutive number inputs")?;
            let date = date.unwrap_or_else(|| {
                Utc::now()
                    .with_timezone(&Config::default().utc_offset())
                    .date_naive()
            });
            let key = DocumentKey::generate(&issuer, date, &consecutive, situation)?;
            println!("{key}");
        }
        Commands::CertStatus { p12, password_env } => {
            let bundle = read_bytes(&p12)?;
            let password = password_from_env(&password_env)?;
            let status = CertificateCredential::inspect(&bundle, &password)
                .with_context(|| format!("cannot open {}", p12.display()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Canonicalize { document, fragment } => {
            let parsed = read_document(&document)?;
            let canonical = match fragment {
                Some(id) => canonicalize_fragment(&parsed, &id)?,
                None => canonicalize(&parsed)?,
            };
            print!("{}", canonical.as_str());
        }
        Commands::Sign {
            document,
            p12,
            password_env,
            issuer_type,
            issuer,
            tenant,
            branch,
            terminal,
            doc_type,
            counter_file,
            situation,
            config,
            out,
        } => {
            let config = match config {
                Some(path) => Config::from_file(&path)?,
                None => Config::default(),
            };
            let parsed = read_document(&document)?;
            let doc_type = match doc_type {
                Some(doc_type) => doc_type,
                None => infer_document_type(&parsed)?,
            };
            let partition = Partition::new(tenant, branch, terminal, doc_type)?;
            let request = IssueRequest::new(partition, IssuerIdentification::new(issuer_type, &issuer)?)
                .with_situation(situation);

            let bundle = read_bytes(&p12)?;
            let password = password_from_env(&password_env)?;
            let credential = CertificateCredential::load_with(&bundle, &password, &config, Utc::now())
                .with_context(|| format!("cannot load {}", p12.display()))?;

            let issuer = DocumentIssuer::new(
                ConsecutiveAllocator::new(FileCounterStore::new(counter_file)),
                DocumentSigner::new(config),
            );
            let issued = issuer.issue(&request, &parsed, &credential)?;
            info!(clave = %issued.clave, consecutive = %issued.consecutive, "signed");

            match out {
                Some(path) => {
                    std::fs::write(&path, issued.xml())
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    let summary = IssueSummary {
                        clave: issued.clave.as_str(),
                        consecutive: issued.consecutive.to_string(),
                        signature_id: issued.signed.signature_id(),
                        out: &path,
                    };
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                None => print!("{}", issued.xml()),
            }
        }
        Commands::Verify { document } => {
            let xml = std::fs::read_to_string(&document)
                .with_context(|| format!("cannot read {}", document.display()))?;
            let result = verify(&xml);
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_valid() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

fn read_document(path: &Path) -> Result<Document> {
    let xml = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    parse_document(&xml).with_context(|| format!("{} is not well-formed XML", path.display()))
}

fn password_from_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("environment variable {name} is not set"))
}

fn infer_document_type(document: &Document) -> Result<DocumentType> {
    let namespace = document.root_namespace()?.unwrap_or_default();
    if let Some(doc_type) = DocumentType::from_namespace(&namespace) {
        return Ok(doc_type);
    }
    match DocumentType::ALL
        .into_iter()
        .find(|t| t.root_element() == document.root().name())
    {
        Some(doc_type) => Ok(doc_type),
        None => bail!(
            "cannot infer the document type of <{}>; pass --doc-type",
            document.root().name()
        ),
    }
}
