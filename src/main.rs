//! Taskforge 命令行入口
//!
//! `taskforge run <goal>`：分解目标（或读取 --plan 步骤文件），按配置装配组件并运行到终态，输出报告。
//! Ctrl+C / SIGTERM 触发紧急停止。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use taskforge::agent::{create_agent_components, default_registry, Collaborators};
use taskforge::config::load_config;
use taskforge::core::NoFixProposer;
use taskforge::plan::{parse_step_proposals, LineDecomposer, PlanStatus};
use taskforge::safety::{AutoApprove, Confirmer, StdinConfirmer};

#[derive(Parser, Debug)]
#[command(name = "taskforge", version, about = "Autonomous task orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decompose a goal into steps and execute them
    Run {
        /// Goal text; steps are split on ';' or newlines unless --plan is given
        goal: String,
        /// JSON file with an array of step proposals
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Extra TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override scheduler.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Approve high-risk actions without prompting
        #[arg(long)]
        approve_high_risk: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge::observability::init();

    let cli = Cli::parse();
    let Command::Run {
        goal,
        plan,
        config,
        max_concurrent,
        approve_high_risk,
        json,
    } = cli.command;

    let mut cfg = load_config(config).context("Failed to load configuration")?;
    if let Some(n) = max_concurrent {
        cfg.scheduler.max_concurrent = n;
    }

    let workspace = cfg.tools.workspace_root();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let confirmer: Arc<dyn Confirmer> = if approve_high_risk {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinConfirmer::new())
    };
    let registry = default_registry(&cfg, &workspace);
    let agent = create_agent_components(
        &cfg,
        registry,
        Collaborators {
            confirmer,
            fix_proposer: Arc::new(NoFixProposer),
            memory: None,
        },
    );
    agent.gate.install_signal_handlers();

    let report = match plan {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read plan file {}", path.display()))?;
            let proposals = parse_step_proposals(&text).context("Invalid plan file")?;
            agent
                .run_proposals(&goal, proposals)
                .await
                .context("Failed to build plan")?
        }
        None => agent
            .run_goal(Arc::new(LineDecomposer), &goal)
            .await
            .context("Failed to build plan")?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{report}");
    }

    if report.status != PlanStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
