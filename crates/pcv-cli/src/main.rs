//! pcv: Picocrypt-compatible volume encryption from the command line
//!
//! Mode is decided by what is dropped on the command line, mirroring the
//! volume conventions:
//!   pcv secret.tar              → encrypt to secret.tar.pcv
//!   pcv secret.tar.pcv          → decrypt to secret.tar
//!   pcv backup.pcv.0            → recombine the chunk series, then decrypt
//!   pcv photos/ notes.txt       → zip-stage, then encrypt to Encrypted.zip.pcv

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;

use pcv_volume::{
    decrypt, encrypt, scan_inputs, CancelFlag, DecryptParams, EncryptParams, Mode, Outcome,
    ProgressFn, ScanResult, SplitSpec,
};

mod stage;

#[derive(Parser, Debug)]
#[command(
    name = "pcv",
    version,
    about = "Picocrypt-compatible file encryption",
    long_about = "pcv: encrypt files and folders into authenticated, error-corrected .pcv volumes"
)]
struct Cli {
    /// Files and folders to process; a single .pcv (or .pcv.N chunk) decrypts
    inputs: Vec<PathBuf>,

    /// Password (prompts interactively when omitted)
    #[arg(long, short = 'p', env = "PCV_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Keyfile to mix into the encryption key (repeatable)
    #[arg(long = "keyfile", short = 'k', value_name = "PATH")]
    keyfiles: Vec<PathBuf>,

    /// Make the keyfile order significant
    #[arg(long, requires = "keyfiles")]
    ordered: bool,

    /// Stronger KDF, a Serpent-CTR cipher layer, and HMAC-SHA3-512
    #[arg(long)]
    paranoid: bool,

    /// Protect the body with Reed-Solomon parity (anti-corruption)
    #[arg(long = "reed-solomon", short = 'r')]
    reed_solomon: bool,

    /// Deflate the staging zip instead of storing entries
    #[arg(long)]
    compress: bool,

    /// Comment stored (unencrypted) in the volume header
    #[arg(long, short = 'c')]
    comment: Option<String>,

    /// Split the finished volume into chunks, e.g. 512KiB, 2GiB, or 4Total
    #[arg(long, value_name = "SIZE")]
    split: Option<String>,

    /// Force decryption past damage and mismatches
    #[arg(long)]
    keep: bool,

    /// Delete the inputs after a successful operation
    #[arg(long)]
    delete: bool,

    /// Override the output path
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let scan = scan_inputs(&cli.inputs)?;
    match scan.mode.clone() {
        Mode::Encrypt { stage_zip } => run_encrypt(&cli, &scan, stage_zip),
        Mode::Decrypt { recombine } => run_decrypt(&cli, &scan, recombine),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Encrypt ──────────────────────────────────────────────────────────────────

fn run_encrypt(cli: &Cli, scan: &ScanResult, stage_zip: bool) -> Result<()> {
    let split_spec = cli
        .split
        .as_deref()
        .map(|s| s.parse::<SplitSpec>())
        .transpose()
        .context("invalid --split value (expected e.g. 512KiB, 2GiB, 4Total)")?;

    let password = resolve_password(cli, true)?;
    if password.is_empty() && cli.keyfiles.is_empty() {
        anyhow::bail!("a password or at least one keyfile is required");
    }

    // Aggregate folder/multi-file inputs into the staging zip. The staging
    // file lives only for the duration of the run.
    let staging = stage_zip.then(|| scan.input.clone());
    if stage_zip {
        let pb = make_progress_bar(scan.total_size, "stage");
        pb.set_message("archiving inputs...");
        stage::build_zip(&cli.inputs, &scan.input, cli.compress, |done| {
            pb.set_position(done)
        })?;
        pb.finish_with_message("archived");
    }

    let params = EncryptParams {
        keyfiles: cli.keyfiles.clone(),
        keyfiles_ordered: cli.ordered,
        paranoid: cli.paranoid,
        reed_solomon: cli.reed_solomon,
        comment: cli.comment.clone().unwrap_or_default(),
        ..EncryptParams::new(SecretString::from(password))
    };

    let output = cli.output.clone().unwrap_or_else(|| scan.output.clone());
    let pb = make_progress_bar(0, "encrypt");
    let result = encrypt(
        &scan.input,
        &output,
        &params,
        Some(&progress_fn(&pb)),
        &CancelFlag::new(),
    );

    // The staging zip is removed no matter how encryption went.
    if let Some(staging) = &staging {
        let _ = std::fs::remove_file(staging);
    }
    result?;
    pb.finish_with_message("done");

    if let Some(spec) = split_spec {
        let pb = make_progress_bar(0, "split");
        let chunks = pcv_volume::split(&output, &spec, Some(&progress_fn(&pb)), &CancelFlag::new())?;
        std::fs::remove_file(&output)
            .with_context(|| format!("removing {}", output.display()))?;
        pb.finish_with_message(format!("{} chunks", chunks.len()));
        println!(
            "Encrypted to {}.0 .. {}.{}",
            output.display(),
            output.display(),
            chunks.len() - 1
        );
    } else {
        println!("Encrypted to {}", output.display());
    }

    if cli.delete {
        delete_inputs(&cli.inputs)?;
    }
    Ok(())
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

fn run_decrypt(cli: &Cli, scan: &ScanResult, recombine: bool) -> Result<()> {
    if let Some(volume) = &scan.volume {
        if volume.comment_damaged {
            println!("Comments are corrupted.");
        } else if !volume.comment.is_empty() {
            println!("Comments: {}", volume.comment);
        }
        if volume.keyfiles_required && cli.keyfiles.is_empty() && !cli.keep {
            anyhow::bail!(
                "this volume requires keyfiles; pass them with --keyfile{}",
                if volume.keyfiles_ordered {
                    " (order matters)"
                } else {
                    ""
                }
            );
        }
    }

    let password = resolve_password(cli, false)?;
    let params = DecryptParams {
        keyfiles: cli.keyfiles.clone(),
        keep: cli.keep,
        ..DecryptParams::new(SecretString::from(password))
    };

    // A chunk series is concatenated into a temporary volume at the series
    // base path first.
    let volume_path = scan.input.clone();
    if recombine {
        let pb = make_progress_bar(scan.total_size, "combine");
        pcv_volume::recombine(
            &scan.input,
            &volume_path,
            Some(&progress_fn(&pb)),
            &CancelFlag::new(),
        )?;
        pb.finish_with_message("recombined");
    }

    let output = cli.output.clone().unwrap_or_else(|| scan.output.clone());
    let pb = make_progress_bar(0, "decrypt");
    let result = decrypt(
        &volume_path,
        &output,
        &params,
        Some(&progress_fn(&pb)),
        &CancelFlag::new(),
    );

    // Drop the recombined temp volume no matter how decryption went.
    if recombine {
        let _ = std::fs::remove_file(&volume_path);
    }
    let outcome = result?;
    pb.finish_with_message("done");

    match outcome {
        Outcome::Clean => println!("Decrypted to {}", output.display()),
        Outcome::Kept => {
            println!("Decrypted to {}", output.display());
            eprintln!("warning: the input volume was modified or damaged; be careful with the output");
        }
    }

    if cli.delete {
        if recombine {
            let mut index = 0;
            while pcv_volume::split::numbered(&scan.input, index).is_file() {
                std::fs::remove_file(pcv_volume::split::numbered(&scan.input, index))?;
                index += 1;
            }
        } else {
            std::fs::remove_file(&scan.input)
                .with_context(|| format!("removing {}", scan.input.display()))?;
        }
    }
    Ok(())
}

// ── Password prompt ──────────────────────────────────────────────────────────

/// Resolve the password: flag/env value, or interactive prompt (with
/// confirmation when encrypting).
fn resolve_password(cli: &Cli, confirm: bool) -> Result<String> {
    if let Some(p) = &cli.password {
        return Ok(p.clone());
    }
    let password =
        rpassword::prompt_password("Password: ").context("failed to read password from terminal")?;
    if confirm {
        let again = rpassword::prompt_password("Confirm password: ")
            .context("failed to read confirmation")?;
        if password != again {
            anyhow::bail!("passwords do not match");
        }
    }
    Ok(password)
}

// ── Progress bars ────────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} (ETA: {eta}) {msg}",
        )
        .unwrap()
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_fn(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, stage| {
        if total > 0 {
            pb.set_length(total);
        }
        pb.set_position(done);
        pb.set_message(stage.to_string());
    })
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

fn delete_inputs(inputs: &[PathBuf]) -> Result<()> {
    for input in inputs {
        remove_path(input)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path).with_context(|| format!("removing {}", path.display()))
    } else {
        std::fs::remove_file(path).with_context(|| format!("removing {}", path.display()))
    }
}
