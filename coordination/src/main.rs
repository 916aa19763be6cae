//! Command-line surface over the mailbox and schedule driver.
//!
//! Worker processes talk to the substrate exclusively through this binary,
//! so the contract is deliberately plain: one verb per invocation, payloads
//! on stdout, exit 0 on success and exit 1 for usage errors. A `recv` that
//! times out prints the `TIMEOUT` sentinel and exits 1 so shell callers can
//! branch on it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use section_coordination::error::{EXIT_TIMEOUT, EXIT_USAGE};
use section_coordination::{
    AgentRegistry, AgentStatus, CoordinationConfig, DriverOutcome, Mailbox, RecvOutcome,
    ScheduleDriver,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a payload onto a queue.
    Send {
        root: PathBuf,
        queue: String,
        payload: String,
    },
    /// Receive the oldest message, waiting up to `timeout` seconds
    /// (0 waits forever).
    Recv {
        root: PathBuf,
        queue: String,
        #[arg(default_value_t = 0)]
        timeout: u64,
    },
    /// Print the number of pending messages.
    Check { root: PathBuf, queue: String },
    /// Claim and print every pending message in order.
    Drain { root: PathBuf, queue: String },
    /// Register an agent as running.
    Register { root: PathBuf, name: String },
    /// Remove an agent's registration.
    Unregister { root: PathBuf, name: String },
    /// List registered agents.
    Agents { root: PathBuf },
    /// Remove a named queue and registration, or everything.
    Cleanup {
        root: PathBuf,
        name: Option<String>,
    },
    /// Operate on a schedule file.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// Print the step to work on, promoting the first waiting step if
    /// nothing is running. Prints COMPLETE when no steps remain.
    Next { path: PathBuf },
    /// Mark the running step done.
    Done { path: PathBuf },
    /// Mark the running step failed.
    Fail { path: PathBuf },
    /// Mark the running step skipped.
    Skip { path: PathBuf },
    /// Demote the first failed step back to waiting.
    Retry { path: PathBuf },
    /// Print the parsed schedule.
    Show { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|e| {
        use clap::error::ErrorKind;
        let _ = e.print();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
            _ => std::process::exit(EXIT_USAGE),
        }
    });
    let config = CoordinationConfig::default();

    match cli.command {
        Command::Send {
            root,
            queue,
            payload,
        } => {
            let bus = Mailbox::open(root, config.poll_interval())?;
            bus.send(&queue, &payload)?;
        }
        Command::Recv {
            root,
            queue,
            timeout,
        } => {
            let bus = Mailbox::open(&root, config.poll_interval())?;
            let registry = AgentRegistry::open(&root)?;
            let _ = registry.set_status(&queue, AgentStatus::Waiting);
            let timeout = (timeout > 0).then(|| Duration::from_secs(timeout));
            let outcome = bus.recv(&queue, timeout).await;
            let _ = registry.set_status(&queue, AgentStatus::Running);
            match outcome? {
                RecvOutcome::Message(msg) => println!("{}", msg.payload),
                RecvOutcome::Timeout => {
                    println!("TIMEOUT");
                    std::process::exit(EXIT_TIMEOUT);
                }
            }
        }
        Command::Check { root, queue } => {
            let bus = Mailbox::open(root, config.poll_interval())?;
            println!("{}", bus.check(&queue)?);
        }
        Command::Drain { root, queue } => {
            let bus = Mailbox::open(root, config.poll_interval())?;
            for msg in bus.drain(&queue)? {
                println!("{}", msg.payload);
            }
        }
        Command::Register { root, name } => {
            AgentRegistry::open(root)?.register(&name)?;
        }
        Command::Unregister { root, name } => {
            AgentRegistry::open(root)?.unregister(&name)?;
        }
        Command::Agents { root } => {
            for agent in AgentRegistry::open(root)?.list()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    agent.name,
                    agent.pid,
                    agent.status.as_str(),
                    agent.updated_at
                );
            }
        }
        Command::Cleanup { root, name } => {
            let bus = Mailbox::open(&root, config.poll_interval())?;
            match name {
                Some(name) => {
                    bus.remove_queue(&name)?;
                    AgentRegistry::open(&root)?.unregister(&name)?;
                }
                None => bus.cleanup_all()?,
            }
        }
        Command::Schedule { action } => run_schedule(action, &config)?,
    }
    Ok(())
}

fn run_schedule(action: ScheduleAction, config: &CoordinationConfig) -> Result<()> {
    let stale = Duration::from_secs(config.lock_stale_secs);
    match action {
        ScheduleAction::Next { path } => {
            match ScheduleDriver::new(path, stale).next()? {
                DriverOutcome::Step(step) => println!("{}. {}", step.number, step.name),
                DriverOutcome::Complete => println!("COMPLETE"),
            }
        }
        ScheduleAction::Done { path } => {
            let step = ScheduleDriver::new(path, stale).done()?;
            println!("{}. {}", step.number, step.name);
        }
        ScheduleAction::Fail { path } => {
            let step = ScheduleDriver::new(path, stale).fail()?;
            println!("{}. {}", step.number, step.name);
        }
        ScheduleAction::Skip { path } => {
            let step = ScheduleDriver::new(path, stale).skip()?;
            println!("{}. {}", step.number, step.name);
        }
        ScheduleAction::Retry { path } => {
            let step = ScheduleDriver::new(path, stale).retry()?;
            println!("{}. {}", step.number, step.name);
        }
        ScheduleAction::Show { path } => {
            let schedule = ScheduleDriver::new(path, stale).load()?;
            print!("{}", schedule.render());
        }
    }
    Ok(())
}
