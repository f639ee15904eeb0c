//! CLI binary for mail2report.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs one mailbox cycle, and prints the outcome
//! records. Scheduling (cron, watch loops) is the caller's business.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mail2report::{
    run_cycle, ImageQuality, MailboxCredentials, OutcomeRecord, PageSize, PipelineConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Poll once, reports to ./output
  mail2report --host imap.example.com --user reports@example.com \
              --sender scanner@example.com

  # Narrow to a domain, bound images for Letter pages
  mail2report --host imap.example.com --user reports@example.com \
              --sender @example.com --page-size letter

  # Cover page with a logo and metadata header
  mail2report --host imap.example.com --user reports@example.com \
              --logo assets/logo.png --metadata

  # Machine-readable outcome records
  mail2report --host imap.example.com --user reports@example.com --json

ENVIRONMENT VARIABLES:
  MAIL2REPORT_SECRET      Mailbox secret (app password); avoids putting it on
                          the command line
  RUST_LOG                Log filter, e.g. mail2report=debug

EXIT STATUS:
  0  cycle ran; at least one attachment succeeded, or there was nothing to do
  1  cycle-fatal error (authentication, connectivity, configuration)
  2  cycle ran but every attachment failed
"#;

/// Turn mailbox PDF attachments into captioned image report PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "mail2report",
    version,
    about = "Turn mailbox PDF attachments into captioned image report PDFs",
    after_help = AFTER_HELP
)]
struct Cli {
    /// IMAP host to poll.
    #[arg(long)]
    host: String,

    /// IMAP port.
    #[arg(long, default_value_t = 993)]
    port: u16,

    /// Mailbox account name.
    #[arg(long)]
    user: String,

    /// Mailbox secret; prefer the environment variable.
    #[arg(long, env = "MAIL2REPORT_SECRET", hide_env_values = true)]
    secret: String,

    /// Disable implicit TLS (local test servers only).
    #[arg(long)]
    no_tls: bool,

    /// IMAP mailbox (folder) to search.
    #[arg(long, default_value = "INBOX")]
    mailbox: String,

    /// Allowed sender; repeat for several. Accepts user@host, @domain, or a
    /// bare domain. No senders means no narrowing.
    #[arg(long = "sender")]
    senders: Vec<String>,

    /// Maximum normalised image width in pixels.
    #[arg(long, default_value_t = 800)]
    max_width: u32,

    /// Maximum normalised image height in pixels.
    #[arg(long, default_value_t = 1000)]
    max_height: u32,

    /// Image quality tier: draft, standard, lossless.
    #[arg(long, default_value = "standard")]
    quality: String,

    /// Logo PNG/JPEG for the report cover page.
    #[arg(long)]
    logo: Option<PathBuf>,

    /// Report title for emails with an empty subject.
    #[arg(long, default_value = "Generated Report")]
    title: String,

    /// Report page size: a4, letter, a3.
    #[arg(long, default_value = "a4")]
    page_size: String,

    /// Draw title/author/date header text on the cover page.
    #[arg(long)]
    metadata: bool,

    /// Directory for downloaded attachments.
    #[arg(long, default_value = "uploads/pdfs")]
    attachment_dir: PathBuf,

    /// Directory for generated reports.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Delete normalised image files once embedded.
    #[arg(long)]
    discard_processed: bool,

    /// Attachments processed concurrently.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Print the full cycle report as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_quality(s: &str) -> Result<ImageQuality> {
    match s.to_ascii_lowercase().as_str() {
        "draft" => Ok(ImageQuality::Draft),
        "standard" => Ok(ImageQuality::Standard),
        "lossless" => Ok(ImageQuality::Lossless),
        other => bail!("unknown quality tier '{other}' (draft, standard, lossless)"),
    }
}

fn parse_page_size(s: &str) -> Result<PageSize> {
    match s.to_ascii_lowercase().as_str() {
        "a4" => Ok(PageSize::A4),
        "letter" => Ok(PageSize::Letter),
        "a3" => Ok(PageSize::A3),
        other => bail!("unknown page size '{other}' (a4, letter, a3)"),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "mail2report=warn",
        1 => "mail2report=info",
        _ => "mail2report=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut builder = PipelineConfig::builder()
        .credentials(MailboxCredentials {
            host: cli.host.clone(),
            port: cli.port,
            user: cli.user.clone(),
            secret: cli.secret.clone(),
            tls: !cli.no_tls,
        })
        .mailbox_name(&cli.mailbox)
        .max_image_dimensions(cli.max_width, cli.max_height)
        .quality(parse_quality(&cli.quality)?)
        .default_title(&cli.title)
        .page_size(parse_page_size(&cli.page_size)?)
        .include_metadata(cli.metadata)
        .attachment_root(&cli.attachment_dir)
        .report_root(&cli.output_dir)
        .keep_processed(!cli.discard_processed)
        .concurrency(cli.concurrency);
    for sender in &cli.senders {
        builder = builder.allowed_sender(sender);
    }
    if let Some(logo) = &cli.logo {
        builder = builder.logo_path(logo);
    }
    let config = builder.build().context("invalid configuration")?;

    let spinner = (!cli.json).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("Polling {}…", cli.host));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let report = run_cycle(&config).await;

    if let Some(bar) = &spinner {
        bar.finish_and_clear();
    }

    let report = report.context("mailbox cycle failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for record in &report.records {
            match record {
                OutcomeRecord::Success {
                    email_subject,
                    report_path,
                    image_count,
                    dropped_images,
                    ..
                } => {
                    let note = if *dropped_images > 0 {
                        yellow(&format!("  ({dropped_images} dropped)"))
                    } else {
                        String::new()
                    };
                    println!(
                        "  {} {}  {}  {}{}",
                        green("✓"),
                        bold(email_subject),
                        dim(&format!("{image_count} images")),
                        report_path.display(),
                        note,
                    );
                }
                OutcomeRecord::Warning {
                    reason,
                    email_subject,
                    ..
                } => {
                    println!("  {} {}  {}", yellow("⚠"), bold(email_subject), reason);
                }
                OutcomeRecord::Failure {
                    reason,
                    email_subject,
                } => {
                    println!("  {} {}  {}", red("✗"), bold(email_subject), red(reason));
                }
            }
        }

        let s = &report.stats;
        eprintln!(
            "{} {} emails, {} attachments → {} reports, {} warnings, {} failures  {}",
            if s.failures == 0 { green("✔") } else { yellow("⚠") },
            s.emails_fetched,
            s.attachments_processed,
            bold(&s.reports_generated.to_string()),
            s.warnings,
            s.failures,
            dim(&format!("{}ms", s.duration_ms)),
        );
    }

    if report.stats.attachments_processed > 0 && report.stats.failures == report.stats.attachments_processed {
        std::process::exit(2);
    }
    Ok(())
}
