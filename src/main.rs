use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dt_mcp_bridge::bridge::Bridge;
use dt_mcp_bridge::config::BridgeConfig;
use dt_mcp_bridge::mailbox::MailboxLayout;
use dt_mcp_bridge::mcp::serve_stdio;
use dt_mcp_bridge::monitor::{enqueue_tool, enqueue_upload, ToolRequest};
use dt_mcp_bridge::upload::UploadRequest;
use serde_json::{Map, Value};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Serve,
    Monitor,
    Call { tool: String, args: Map<String, Value> },
    EnqueueUpload { file: PathBuf, remote: Option<String> },
    EnqueueTool { tool: String, args: Map<String, Value> },
    Help,
}

#[derive(Debug, Clone, PartialEq)]
struct CliArgs {
    config_dir: Option<PathBuf>,
    command: CliCommand,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let cli = parse_cli_args(cli_args.as_slice())?;
    if cli.command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    let config = BridgeConfig::resolve(cli.config_dir.as_deref())?;
    info!(
        config_dir = %config.config_dir.display(),
        db_path = %config.db_path.display(),
        "configuration resolved"
    );

    match cli.command {
        CliCommand::Serve => run_serve(config).await,
        CliCommand::Monitor => run_monitor(config).await,
        CliCommand::Call { tool, args } => run_call(config, tool, args).await,
        CliCommand::EnqueueUpload { file, remote } => {
            let layout = MailboxLayout::new(config.mcp_dir());
            let path = enqueue_upload(
                &layout,
                &UploadRequest {
                    source_file: file,
                    target_remote: remote,
                },
            )?;
            println!("{}", path.display());
            Ok(())
        }
        CliCommand::EnqueueTool { tool, args } => {
            let layout = MailboxLayout::new(config.mcp_dir());
            let path = enqueue_tool(&layout, &ToolRequest { tool, args })?;
            println!("{}", path.display());
            Ok(())
        }
        CliCommand::Help => Ok(()),
    }
}

// Stdout carries JSON-RPC; logs go to stderr.
fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init();
}

async fn run_serve(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = Bridge::from_config(config);
    let stop = Arc::new(AtomicBool::new(false));

    let monitor = bridge.monitor();
    let monitor_stop = stop.clone();
    let monitor_task = tokio::task::spawn_blocking(move || monitor.run(&monitor_stop));

    // A blocking stdin read would hold up runtime shutdown, so the stdio
    // loop lives on a plain thread.
    let dispatcher = bridge.dispatcher().clone();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<io::Result<()>>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let result = serve_stdio(dispatcher.as_ref(), stdin.lock(), stdout.lock());
        let _ = done_tx.send(result);
    });

    tokio::select! {
        finished = done_rx => match finished {
            Ok(Ok(())) => info!("stdio client disconnected"),
            Ok(Err(err)) => error!(error = %err, "stdio server failed"),
            Err(_) => error!("stdio server thread ended without reporting"),
        },
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, shutting down");
        }
    }

    stop.store(true, Ordering::SeqCst);
    monitor_task.await?;
    Ok(())
}

async fn run_monitor(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = Bridge::from_config(config);
    let stop = Arc::new(AtomicBool::new(false));
    let monitor = bridge.monitor();
    let monitor_stop = stop.clone();
    let monitor_task = tokio::task::spawn_blocking(move || monitor.run(&monitor_stop));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping monitor");
    stop.store(true, Ordering::SeqCst);
    monitor_task.await?;
    Ok(())
}

async fn run_call(
    config: BridgeConfig,
    tool: String,
    args: Map<String, Value>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = Bridge::from_config(config);
    let dispatcher = bridge.dispatcher().clone();
    let output =
        tokio::task::spawn_blocking(move || dispatcher.invoke(tool.as_str(), &args)).await??;
    println!("{output}");
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliArgs, io::Error> {
    let mut config_dir = None::<PathBuf>;
    let mut positional = Vec::<String>::new();
    let mut file = None::<PathBuf>;
    let mut remote = None::<String>;
    let mut tool_flag = None::<String>;
    let mut args_flag = None::<String>;

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, io::Error> {
            let Some(value) = args.get(idx + 1) else {
                return Err(io::Error::other(format!("Missing value for {flag}")));
            };
            Ok(value.clone())
        };

        match flag {
            "-h" | "--help" => {
                return Ok(CliArgs {
                    config_dir,
                    command: CliCommand::Help,
                })
            }
            "--config-dir" => {
                config_dir = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--file" => {
                file = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--remote" => {
                remote = Some(needs_value(i)?);
                i += 2;
            }
            "--tool" => {
                tool_flag = Some(needs_value(i)?);
                i += 2;
            }
            "--args" => {
                args_flag = Some(needs_value(i)?);
                i += 2;
            }
            unknown if unknown.starts_with("--") => {
                return Err(io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                )));
            }
            value => {
                positional.push(value.to_string());
                i += 1;
            }
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("serve") => CliCommand::Serve,
        Some("monitor") => CliCommand::Monitor,
        Some("call") => {
            let tool = positional
                .next()
                .ok_or_else(|| io::Error::other("call requires a tool name"))?;
            let args = parse_json_args(positional.next().as_deref())?;
            CliCommand::Call { tool, args }
        }
        Some("enqueue-upload") => CliCommand::EnqueueUpload {
            file: file.ok_or_else(|| io::Error::other("enqueue-upload requires --file"))?,
            remote,
        },
        Some("enqueue-tool") => CliCommand::EnqueueTool {
            tool: tool_flag.ok_or_else(|| io::Error::other("enqueue-tool requires --tool"))?,
            args: parse_json_args(args_flag.as_deref())?,
        },
        Some(other) => {
            return Err(io::Error::other(format!(
                "Unknown command: {other}\n\nUse --help for usage."
            )))
        }
    };
    if let Some(extra) = positional.next() {
        return Err(io::Error::other(format!("Unexpected argument: {extra}")));
    }

    Ok(CliArgs {
        config_dir,
        command,
    })
}

fn parse_json_args(raw: Option<&str>) -> Result<Map<String, Value>, io::Error> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(io::Error::other("tool arguments must be a JSON object")),
        Err(err) => Err(io::Error::other(format!("Invalid JSON arguments: {err}"))),
    }
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  dt-mcp-bridge [--config-dir PATH] [serve]\n",
        "  dt-mcp-bridge [--config-dir PATH] monitor\n",
        "  dt-mcp-bridge [--config-dir PATH] call <tool> [json-args]\n",
        "  dt-mcp-bridge [--config-dir PATH] enqueue-upload --file PATH [--remote REMOTE]\n",
        "  dt-mcp-bridge [--config-dir PATH] enqueue-tool --tool NAME [--args JSON]\n\n",
        "Defaults:\n",
        "  --config-dir defaults to $DT_MCP_CONFIG_DIR, then ~/.config/darktable\n",
        "  settings file: <config-dir>/mcp/bridge.settings.toml (DT_MCP_* env vars override it)\n"
    ));
}
