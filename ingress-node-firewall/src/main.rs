use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use log::info;
use serde_json::{Value, json};

use ingress_node_firewall::{
    ebpf_loader::{
        ControllerOptions, DEFAULT_PIN_DIR, FirewallController, MAP_RULES_TABLE, XdpMode,
        release_pinned_links,
    },
    events::shutdown_signal,
    model::{FirewallRules, action_name, load_policies, protocol_name},
    sink::{AuditMode, RetryPolicy},
    store::{LpmRuleTable, RuleTable, describe_key},
};
use ingress_node_firewall_common::{LpmKey, RulesValue};

#[derive(Parser)]
#[command(name = "ingress-node-firewall")]
#[command(about = "Ingress node firewall daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach, load rules and log filtering events until SIGINT/SIGTERM
    Run(RunCommand),
    /// Apply policy documents to the pinned rule table
    Reconcile(ReconcileCommand),
    /// Attach the program to interfaces and leave the links pinned
    Attach(AttachCommand),
    /// Release links pinned by an earlier attach
    Detach(DetachCommand),
    /// Print rule table metadata and entries as JSON
    ///
    /// Keys carry no address family: `cidr` shows a prefix of at most 32 bits
    /// over zero tail bytes as IPv4, so check `ipData` for IPv6 ranges such as
    /// 2001:db8::/32.
    Info(PinDirArgs),
}

#[derive(Args)]
struct PinDirArgs {
    /// bpffs directory holding the pinned table and links
    #[arg(long, value_name = "DIR", default_value = DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
}

#[derive(Args)]
struct ProgramArgs {
    /// Compiled filtering program object
    #[arg(long, value_name = "OBJ")]
    program: PathBuf,
    #[command(flatten)]
    pins: PinDirArgs,
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,
}

#[derive(Args)]
struct RunCommand {
    #[command(flatten)]
    program: ProgramArgs,
    /// JSON policy file, one document or a list of them
    #[arg(long, value_name = "FILE")]
    policy: PathBuf,
    /// Interfaces to protect
    #[arg(long = "iface", value_name = "IFACE", required = true)]
    ifaces: Vec<String>,
    /// Where audit lines are written
    #[arg(long, value_enum, default_value_t = AuditMode::Syslog)]
    audit: AuditMode,
}

#[derive(Args)]
struct ReconcileCommand {
    #[command(flatten)]
    pins: PinDirArgs,
    #[arg(long, value_name = "FILE")]
    policy: PathBuf,
    /// Remove the entries for the policy's source ranges instead of writing them
    #[arg(long, action = ArgAction::SetTrue)]
    delete: bool,
}

#[derive(Args)]
struct AttachCommand {
    #[command(flatten)]
    program: ProgramArgs,
    #[arg(long = "iface", value_name = "IFACE", required = true)]
    ifaces: Vec<String>,
}

#[derive(Args)]
struct DetachCommand {
    #[command(flatten)]
    pins: PinDirArgs,
    #[arg(long = "iface", value_name = "IFACE", required = true)]
    ifaces: Vec<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("ingress-node-firewall error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => run_daemon(cmd).await?,
        Some(Commands::Reconcile(cmd)) => {
            let policies = load_policies(&cmd.policy)?;
            let pin = cmd.pins.pin_dir.join(MAP_RULES_TABLE);
            let mut table = LpmRuleTable::open_pinned(&pin)
                .with_context(|| format!("failed to open rule table at {}", pin.display()))?;
            for policy in &policies {
                let report = ingress_node_firewall::compiler::apply(&mut table, policy, cmd.delete)
                    .context("Failed to create map firewall rules")?;
                println!(
                    "upserted {} deleted {} missing {}",
                    report.upserted, report.deleted, report.missing
                );
            }
        }
        Some(Commands::Attach(cmd)) => {
            let mut controller = FirewallController::new(&controller_options(&cmd.program))?;
            controller.attach_interfaces(&cmd.ifaces, false)?;
            for record in controller.attachments() {
                println!("{} -> {}", record.iface, record.pin_path.display());
            }
        }
        Some(Commands::Detach(cmd)) => {
            let released = release_pinned_links(&cmd.pins.pin_dir, &cmd.ifaces)?;
            println!("released {released} link(s)");
        }
        Some(Commands::Info(pins)) => {
            let pin = pins.pin_dir.join(MAP_RULES_TABLE);
            let table = LpmRuleTable::open_pinned(&pin)
                .with_context(|| format!("failed to open rule table at {}", pin.display()))?;
            let info = table.info()?;
            let entries = table
                .entries()?
                .iter()
                .map(|(key, value)| entry_json(key, value))
                .collect::<Vec<_>>();
            let out = json!({
                "map": {
                    "name": info.name,
                    "id": info.id,
                    "keySize": info.key_size,
                    "valueSize": info.value_size,
                    "maxEntries": info.max_entries,
                    "flags": info.map_flags,
                },
                "entries": entries,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn controller_options(args: &ProgramArgs) -> ControllerOptions {
    ControllerOptions {
        program: args.program.clone(),
        pin_dir: args.pins.pin_dir.clone(),
        xdp_mode: args.xdp_mode,
    }
}

async fn run_daemon(cmd: RunCommand) -> Result<()> {
    let policies: Vec<FirewallRules> = load_policies(&cmd.policy)?;
    let mut controller = FirewallController::new(&controller_options(&cmd.program))?;

    let started = start(&mut controller, &cmd, &policies).await;
    let pipeline = match started {
        Ok(pipeline) => pipeline,
        Err(err) => {
            controller.cleanup().ok();
            return Err(err);
        }
    };

    pipeline.join().await;
    info!("Detaching IngressNode Firewall program");
    controller
        .cleanup()
        .context("failed to release firewall resources")?;
    Ok(())
}

async fn start(
    controller: &mut FirewallController,
    cmd: &RunCommand,
    policies: &[FirewallRules],
) -> Result<ingress_node_firewall::events::PipelineHandle> {
    for policy in policies {
        controller
            .reconcile_rules(policy, false)
            .context("Failed to create map firewall rules")?;
    }
    info!(
        "{} source ranges in {}",
        controller.table_entries()?.len(),
        controller.table_info()?
    );
    controller.attach_interfaces(&cmd.ifaces, false)?;
    let pipeline = controller
        .start_events(cmd.audit, RetryPolicy::default(), shutdown_signal())
        .await
        .context("Failed to load perf stats")?;
    Ok(pipeline)
}

/// Renders a table entry with both the guessed CIDR and the raw key bytes.
fn entry_json(key: &LpmKey, value: &RulesValue) -> Value {
    let key = describe_key(key);
    let rules = value
        .active()
        .iter()
        .map(|rule| {
            let protocol = match protocol_name(rule.protocol) {
                Some(name) => name.to_string(),
                None => rule.protocol.to_string(),
            };
            json!({
                "ruleId": rule.rule_id,
                "protocol": protocol,
                "dstPortStart": rule.dst_port_start,
                "dstPortEnd": rule.dst_port_end,
                "icmpType": rule.icmp_type,
                "icmpCode": rule.icmp_code,
                "action": action_name(rule.action),
            })
        })
        .collect::<Vec<_>>();
    json!({
        "cidr": key.cidr,
        "ipData": key.ip_data,
        "prefixLen": key.prefix_len,
        "rules": rules,
    })
}
