use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Kestrel build system", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check formatting, run clippy and the test suite
    Ci,
    /// Run every CLI scenario under both schedulers
    Scenarios {
        /// Also run each scenario with an unbounded donation walk
        #[arg(long)]
        unbounded: bool,
    },
    /// Clean build artifacts
    Clean,
}

const SCENARIOS: &[&str] = &[
    "donate-one",
    "donate-nested",
    "donate-multiple",
    "donate-chain",
    "wake-order",
    "condvar",
    "file-lock",
];

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let project_root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .context("xtask lives two levels below the workspace root")?;
    sh.change_dir(project_root);

    match cli.command {
        Commands::Ci => {
            cmd!(sh, "cargo fmt --all -- --check").run()?;
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
            cmd!(sh, "cargo test --workspace").run()?;
        }
        Commands::Scenarios { unbounded } => {
            cmd!(sh, "cargo build -p kestrel-cli").run()?;
            for &scenario in SCENARIOS {
                for scheduler in ["priority", "round-robin"] {
                    run_scenario(&sh, &[scenario, "--scheduler", scheduler])?;
                }
                if unbounded {
                    run_scenario(&sh, &[scenario, "--unbounded-donation"])?;
                }
            }
            cmd!(sh, "cargo run -q -p kestrel-cli -- stress --threads 12 --rounds 20").run()?;
        }
        Commands::Clean => {
            cmd!(sh, "cargo clean").run()?;
        }
    }

    Ok(())
}

fn run_scenario(sh: &Shell, args: &[&str]) -> Result<()> {
    println!("==> kestrel scenario {}", args.join(" "));
    cmd!(sh, "cargo run -q -p kestrel-cli -- scenario")
        .args(args)
        .run()
        .with_context(|| format!("scenario {} failed", args.join(" ")))?;
    Ok(())
}
