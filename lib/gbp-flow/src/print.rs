// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print flows, groups, and edits in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both gbpadm and integration tests.

use crate::engine::flow::fmt_actions;
use crate::engine::flow::FlowEntry;
use crate::engine::group::GroupEntry;
use crate::engine::range_mask::Mask;
use crate::engine::table_state::FlowEdit;
use crate::engine::table_state::GroupEdit;
use itertools::Itertools;
use std::io::Write;
use tabwriter::TabWriter;

/// Print flows, grouped by table.
pub fn print_flows(flows: &[FlowEntry]) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), flows)
}

/// Print flows, grouped by table, into a given writer.
pub fn print_flows_into(
    writer: &mut impl Write,
    flows: &[FlowEntry],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    for (table, chunk) in &flows.iter().chunk_by(|f| f.table) {
        writeln!(t, "Table {table}")?;
        write_hr(&mut t)?;
        writeln!(t, "PRIO\tCOOKIE\tMATCH\tACTIONS")?;
        let mut chunk: Vec<&FlowEntry> = chunk.collect();
        chunk.sort_by(|a, b| b.priority.cmp(&a.priority));
        for f in chunk {
            print_flow(&mut t, f)?;
        }
        writeln!(t)?;
        t.flush()?;
    }

    t.flush()
}

fn print_flow(t: &mut impl Write, f: &FlowEntry) -> std::io::Result<()> {
    let m = f.matches.to_string();
    writeln!(
        t,
        "{}\t{:#x}\t{}\t{}",
        f.priority,
        f.cookie,
        if m.is_empty() { "*" } else { &m },
        fmt_actions(&f.actions),
    )
}

/// Print groups.
pub fn print_groups(groups: &[GroupEntry]) -> std::io::Result<()> {
    print_groups_into(&mut std::io::stdout(), groups)
}

/// Print groups into a given writer.
pub fn print_groups_into(
    writer: &mut impl Write,
    groups: &[GroupEntry],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "GROUP\tBUCKET\tACTIONS")?;

    for g in groups {
        for b in g.buckets() {
            writeln!(t, "{:#x}\t{}\t{}", g.id, b.id, fmt_actions(&b.actions))?;
        }
    }
    t.flush()
}

/// Print a batch of flow and group edits into a given writer.
pub fn print_flow_edits_into(
    writer: &mut impl Write,
    flows: &[FlowEdit],
    groups: &[GroupEdit],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "OP\tTABLE\tPRIO\tMATCH\tACTIONS")?;

    for g in groups {
        writeln!(t, "{:?}\tgroup\t-\t{:#x}\t-", g.kind(), g.group_id())?;
    }

    for e in flows {
        let f = e.entry();
        writeln!(
            t,
            "{:?}\t{}\t{}\t{}\t{}",
            e.kind(),
            f.table,
            f.priority,
            f.matches,
            fmt_actions(&f.actions),
        )?;
    }
    t.flush()
}

/// Print the masks covering a range into a given writer.
pub fn print_masks_into(
    writer: &mut impl Write,
    masks: &[Mask],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "VALUE\tMASK")?;
    for m in masks {
        writeln!(t, "0x{:04x}\t0x{:04x}", m.value, m.mask)?;
    }
    t.flush()
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow::Action;
    use crate::engine::flow::FlowBuilder;
    use crate::engine::group::GroupBuilder;
    use crate::engine::range_mask::get_masks;

    #[test]
    fn flows_render() {
        let mut a = FlowBuilder::new().priority(1).go(2).build();
        a.table = 1;
        let mut b = FlowBuilder::new().priority(25).eth_type(0x0806).build();
        b.table = 1;
        let mut out = vec![];
        print_flows_into(&mut out, &[a, b]).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("Table 1"));
        assert!(s.contains("goto_table:2"));
        assert!(s.contains("drop"));
        // Highest priority first.
        assert!(s.find("25").unwrap() < s.find("goto_table").unwrap());
    }

    #[test]
    fn masks_render() {
        let mut out = vec![];
        print_masks_into(&mut out, &get_masks(Some(0), Some(1))).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("0x0000"));
        assert!(s.contains("0xfffe"));
    }

    #[test]
    fn edits_render() {
        let mut add = FlowBuilder::new().priority(10).reg(4, 1).output(3).build();
        add.table = 4;
        let mut del = FlowBuilder::new().priority(7).eth_type(0x0806).build();
        del.table = 2;
        let group = GroupBuilder::new(0x2a).bucket(1, vec![Action::Output(3)]).build();

        let mut out = vec![];
        print_flow_edits_into(
            &mut out,
            &[FlowEdit::Add(add), FlowEdit::Del(del)],
            &[GroupEdit::Mod(group), GroupEdit::Del(0x2b)],
        )
        .unwrap();
        let s = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("OP"));
        assert!(lines[1].starts_with("Mod") && lines[1].contains("0x2a"));
        assert!(lines[2].starts_with("Del") && lines[2].contains("0x2b"));
        assert!(lines[3].starts_with("Add") && lines[3].contains("output:3"));
        assert!(lines[4].starts_with("Del") && lines[4].contains("eth_type=0x0806"));
        assert!(lines[4].contains("drop"));
    }
}
