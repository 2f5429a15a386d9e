mod scenarios;

use clap::{Parser, Subcommand, ValueEnum};
use kestrel_kernel::{KernelConfig, Priority, SchedulerKind, DEFAULT_MAX_DONATION_DEPTH};
use scenarios::Scenario;
use std::error::Error;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Longest blocked-on chain a donation is propagated along
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_DONATION_DEPTH)]
    max_donation_depth: usize,

    /// Propagate donations along chains of any length
    #[arg(long, global = true, conflicts_with = "max_donation_depth")]
    unbounded_donation: bool,

    /// Ready-queue policy
    #[arg(long, global = true, value_enum, default_value_t = SchedulerArg::Priority)]
    scheduler: SchedulerArg,

    /// Priority of the booting thread
    #[arg(long, global = true, default_value_t = Priority::DEFAULT.val())]
    main_priority: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchedulerArg {
    Priority,
    RoundRobin,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a narrated synchronization scenario
    Scenario {
        #[arg(value_enum)]
        name: Scenario,
    },
    /// Contend locks from threads of random priority
    Stress {
        #[arg(long, default_value_t = 8)]
        threads: usize,

        #[arg(long, default_value_t = 50)]
        rounds: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

impl Cli {
    fn kernel_config(&self) -> Result<KernelConfig, Box<dyn Error>> {
        let config = KernelConfig {
            max_donation_depth: if self.unbounded_donation {
                None
            } else {
                Some(self.max_donation_depth)
            },
            scheduler: match self.scheduler {
                SchedulerArg::Priority => SchedulerKind::Priority,
                SchedulerArg::RoundRobin => SchedulerKind::RoundRobin,
            },
            main_priority: Priority::try_from(self.main_priority)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.kernel_config()?;

    match cli.command {
        Commands::Scenario { name } => {
            println!("Running scenario {name:?} ({:?} scheduler)", config.scheduler);
            scenarios::run(name, config)?;
            println!("Scenario completed.");
        }
        Commands::Stress {
            threads,
            rounds,
            seed,
        } => {
            println!("Stressing {threads} threads x {rounds} rounds (seed {seed})...");
            let report = scenarios::stress(config, threads, rounds, seed)?;
            println!(
                "{} critical sections, {} contended acquires, {} entered with a donation, highest donated priority {}",
                report.critical_sections,
                report.contended_acquires,
                report.donated_entries,
                report.highest_donation
            );
        }
    }

    Ok(())
}
