use alloy_primitives::B256;
use argh::FromArgs;
use homy_oracle::{
    HomyEngine, HomyEngineResult, OracleClient, OracleConfig, PollPolicy, RequestId, plan_prompt,
    proposal_prompt,
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};

// how often the engine is polled for progress
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskResponse {
    pub prompt: String,
    pub tx_hash: String,
    pub request_id: String,
    pub duration: Duration,
    pub response: String,
}

#[derive(FromArgs)]
/// Homy client for asking the on-chain inference oracle
struct HomyArgs {
    /// path to a JSON config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// seconds to wait for a transaction to be mined
    #[argh(option, short = 't')]
    mining_timeout_secs: Option<u64>,

    /// command to execute
    #[argh(subcommand)]
    command: HomyCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum HomyCommands {
    Ask(AskCommand),
    Plan(PlanCommand),
    Propose(ProposeCommand),
    RequestId(RequestIdCommand),
    Result(ResultCommand),
}

#[derive(FromArgs)]
/// Ask Homy a question
#[argh(subcommand, name = "ask")]
struct AskCommand {
    /// the prompt to send
    #[argh(positional)]
    prompt: String,
}

#[derive(FromArgs)]
/// Generate a plan for a task
#[argh(subcommand, name = "plan")]
struct PlanCommand {
    /// the task to plan
    #[argh(positional)]
    task: String,
}

#[derive(FromArgs)]
/// Write a proposal
#[argh(subcommand, name = "propose")]
struct ProposeCommand {
    /// the proposal title
    #[argh(option)]
    title: String,

    /// the proposal description
    #[argh(option)]
    description: String,
}

#[derive(FromArgs)]
/// Read the request id out of a mined transaction
#[argh(subcommand, name = "request-id")]
struct RequestIdCommand {
    /// the transaction hash
    #[argh(positional)]
    tx_hash: String,
}

#[derive(FromArgs)]
/// Poll for the result of an earlier request
#[argh(subcommand, name = "result")]
struct ResultCommand {
    /// the request id, decimal or 0x-prefixed hex
    #[argh(positional)]
    request_id: String,

    /// override the number of attempts
    #[argh(option, short = 'a')]
    attempts: Option<u32>,
}

fn load_config(args: &HomyArgs) -> Result<OracleConfig, Box<dyn std::error::Error>> {
    let mut config = match (&args.config, args.mining_timeout_secs) {
        (Some(path), _) => OracleConfig::from_file(path)?,
        (None, Some(secs)) => OracleConfig::new(Duration::from_secs(secs)),
        (None, None) => {
            return Err("a mining timeout is required: pass --mining-timeout-secs or --config".into());
        }
    };
    config.apply_env_overrides()?;
    if let Some(secs) = args.mining_timeout_secs {
        config.mining_timeout_secs = secs;
    }
    Ok(config)
}

async fn run_prompt(
    client: Arc<OracleClient>,
    prompt: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = HomyEngine::new(client);
    let id = engine.schedule_inference(prompt);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;
    let mut last_phase = "";

    loop {
        match engine.try_poll_response() {
            HomyEngineResult::Success(result) => {
                let response = AskResponse {
                    prompt: result.prompt,
                    tx_hash: result.ticket.tx_hash.to_string(),
                    request_id: result.ticket.request_id.to_string(),
                    duration: result.duration,
                    response: result.response,
                };
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            HomyEngineResult::Failed(failure) => {
                if let Some(ticket) = failure.ticket {
                    log::warn!(
                        "transaction {} is mined; recover later with `result {}`",
                        ticket.tx_hash,
                        ticket.request_id
                    );
                } else if let Some(tx_hash) = failure.error.tx_hash() {
                    log::warn!(
                        "transaction {tx_hash} was broadcast; recover later with `request-id {tx_hash}`"
                    );
                }
                return Err(failure.error.into());
            }
            HomyEngineResult::Error(e) => return Err(e.into()),
            HomyEngineResult::Empty(phase) => {
                if phase.as_str() != last_phase {
                    log::info!("Homy is {}", phase.as_str());
                    last_phase = phase.as_str();
                }
                tokio::select! {
                    _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
                    _ = &mut ctrl_c, if !cancelled => {
                        log::warn!("Cancelling; a broadcast transaction cannot be withdrawn");
                        cancelled = true;
                        engine.cancel(id);
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: HomyArgs = argh::from_env();

    let config = load_config(&args)?;
    let client = Arc::new(config.connect()?);

    match args.command {
        HomyCommands::Ask(ask) => run_prompt(client, ask.prompt).await?,
        HomyCommands::Plan(plan) => {
            let prompt = plan_prompt(&plan.task).ok_or("the task cannot be empty")?;
            run_prompt(client, prompt).await?
        }
        HomyCommands::Propose(propose) => {
            let prompt = proposal_prompt(&propose.title, &propose.description)
                .ok_or("title and description are both required")?;
            run_prompt(client, prompt).await?
        }
        HomyCommands::RequestId(command) => {
            let tx_hash: B256 = command.tx_hash.trim().parse()?;
            let request_id = client.extract_request_id(tx_hash).await?;
            println!("{request_id}");
        }
        HomyCommands::Result(command) => {
            let request_id: RequestId = command.request_id.parse()?;
            let default = client.poll_policy();
            let policy = PollPolicy {
                max_attempts: command.attempts.unwrap_or(default.max_attempts),
                ..default
            };
            let response = client.poll_for_result(request_id, policy).await?;
            println!("{response}");
        }
    }

    Ok(())
}
