// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::anyhow;
use clap::Args;
use clap::Parser;
use slog::Drain;
use slog::Logger;

use gbp_agent::cfg::AgentConfig;
use gbp_agent::engine::FlowManager;
use gbp_agent::engine::consts::ns;
use gbp_agent::mcast::read_multicast_groups;
use gbp_agent::model::PolicySnapshot;
use gbp_agent::model::PolicyStore;
use gbp_api::API_VERSION;
use gbp_flow::engine::FlowEntry;
use gbp_flow::engine::IdGenerator;
use gbp_flow::engine::MockSwitch;
use gbp_flow::engine::GroupEntry;
use gbp_flow::engine::range_mask::get_masks;
use gbp_flow::engine::table_state::diff_flows;
use gbp_flow::engine::table_state::diff_groups;
use gbp_flow::print::print_flow_edits_into;
use gbp_flow::print::print_flows;
use gbp_flow::print::print_groups;
use gbp_flow::print::print_masks_into;

/// Inspect the flows the GBP agent synthesizes for the integration
/// bridge.
#[derive(Debug, Parser)]
#[command(version = pkg_version())]
enum Command {
    /// Synthesize the pipeline for a policy and dump its flows.
    DumpFlows {
        #[command(flatten)]
        input: PipelineInput,

        /// Only dump this table.
        #[arg(short, long)]
        table: Option<u8>,
    },

    /// Synthesize the pipeline for a policy and dump its groups.
    DumpGroups {
        #[command(flatten)]
        input: PipelineInput,
    },

    /// Show the flow and group edits that move the pipeline built from
    /// one policy to the pipeline built from another.
    Diff {
        #[command(flatten)]
        input: PipelineInput,

        /// The policy snapshot (JSON) to move to.
        #[arg(long)]
        to: PathBuf,
    },

    /// Show the value/mask pairs covering a port or VLAN range.
    RangeMask { start: u16, end: u16 },

    /// List the multicast groups recorded in a multicast group file.
    Mcast { file: PathBuf },

    /// Resolve a policy flow cookie to the classifier it came from.
    Cookie {
        /// The directory the agent persists its ids in.
        #[arg(long)]
        id_dir: PathBuf,

        cookie: u64,
    },
}

#[derive(Args, Clone, Debug)]
struct PipelineInput {
    /// Agent configuration (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy snapshot (JSON).
    #[arg(short, long)]
    policy: PathBuf,

    /// Interface to port number bindings, as `name=port`.
    #[arg(long = "port", value_parser = parse_port)]
    ports: Vec<(String, u32)>,
}

fn parse_port(s: &str) -> Result<(String, u32), String> {
    let (name, port) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=port, got {s}"))?;
    let port = port.parse().map_err(|e| format!("bad port number {port}: {e}"))?;
    Ok((name.to_string(), port))
}

fn pkg_version() -> String {
    format!("{}.{API_VERSION}", env!("CARGO_PKG_VERSION"))
}

fn init_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).chan_size(0x2000).build().fuse();
    Logger::root(drain, slog::o!())
}

/// Run the flow manager over an in-memory switch until every scope has
/// been computed.
fn synthesize(log: &Logger, input: &PipelineInput) -> anyhow::Result<FlowManager<MockSwitch>> {
    let cfg = match &input.config {
        Some(path) => AgentConfig::from_file(log, path)?,
        None => AgentConfig::default(),
    };
    let snap = PolicySnapshot::from_json_file(&input.policy)?;

    let mut mgr = FlowManager::new(log, cfg, PolicyStore::from(snap), MockSwitch::new())
        .context("bad agent configuration")?;
    mgr.start();
    for (name, port) in &input.ports {
        mgr.port_status_update(name, Some(*port));
    }
    mgr.resync_all();
    Ok(mgr)
}

fn group_map(groups: Vec<GroupEntry>) -> BTreeMap<u32, GroupEntry> {
    groups.into_iter().map(|g| (g.id, g)).collect()
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let log = init_logger();

    match cmd {
        Command::DumpFlows { input, table } => {
            let mgr = synthesize(&log, &input)?;
            let flows: Vec<FlowEntry> = match table {
                Some(t) => mgr.switch().conn().table(t),
                None => mgr.switch().conn().flows(),
            };
            print_flows(&flows)?;
        }

        Command::DumpGroups { input } => {
            let mgr = synthesize(&log, &input)?;
            print_groups(&mgr.switch().conn().groups())?;
        }

        Command::Diff { input, to } => {
            let old = synthesize(&log, &input)?;
            let new = synthesize(&log, &PipelineInput { policy: to, ..input })?;
            let (from, to) = (old.switch().conn(), new.switch().conn());

            let flows = diff_flows(&to.flows(), &from.flows());
            let groups = diff_groups(&group_map(to.groups()), &group_map(from.groups()));
            print_flow_edits_into(&mut io::stdout(), &flows, &groups)?;
        }

        Command::RangeMask { start, end } => {
            let masks = get_masks(Some(start), Some(end));
            print_masks_into(&mut io::stdout(), &masks)?;
        }

        Command::Mcast { file } => {
            for ip in read_multicast_groups(&log, &file) {
                println!("{ip}");
            }
        }

        Command::Cookie { id_dir, cookie } => {
            let id = u32::try_from(cookie)
                .map_err(|_| anyhow!("cookie {cookie:#x} is not a classifier cookie"))?;
            let ids = IdGenerator::new(&log, Some(id_dir));
            ids.init_namespace(ns::CLASSIFIER_RULE)?;
            match ids.get_key(ns::CLASSIFIER_RULE, id) {
                Some(key) => println!("{key}"),
                None => return Err(anyhow!("no classifier holds cookie {cookie:#x}")),
            }
        }
    }

    Ok(())
}
