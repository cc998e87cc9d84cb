//! HTB shaping tree for one interface
//!
//! The tree is rendered in full on every change and submitted as a single
//! `tc -force -batch -` of `replace` verbs. Classes and filters that dropped
//! out of the desired tree are deleted afterwards, so a live class is never
//! removed while its replacement is pending.

use super::exec::CommandSpec;
use crate::error::{Result, SliceError};
use crate::models::{mbps_to_kbps, BandwidthPolicy, Vni};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Root class; parent of every slice class
const ROOT_MINOR: u16 = 0x1;
/// Unclassified traffic
const DEFAULT_MINOR: u16 = 0x2;
const FIRST_SLICE_MINOR: u16 = 0x10;
const MAX_MINOR: u16 = 0xfffe;
/// u32 item ids in hash table 800 are 12 bits
const MAX_FILTER_ID: u16 = 0xfff;
const FILTER_PRIO: u8 = 1;
const BEST_EFFORT_PRIO: u8 = 7;
/// Floor for the best-effort class so it never starves completely
const MIN_BEST_EFFORT_KBIT: u64 = 8;

#[derive(Debug, Clone, PartialEq)]
struct SliceClass {
    policy: BandwidthPolicy,
    minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterEntry {
    slice_id: String,
    id: u16,
}

/// Desired and applied shaping state of one interface
#[derive(Debug, Clone)]
pub struct ShapingTree {
    interface: String,
    link_kbit: u64,
    classes: BTreeMap<String, SliceClass>,
    tunnels: BTreeMap<Vni, FilterEntry>,
    applied_classes: BTreeSet<u16>,
    applied_filters: BTreeSet<u16>,
    root_applied: bool,
}

impl ShapingTree {
    pub fn new(interface: impl Into<String>, link_mbps: f64) -> Self {
        Self {
            interface: interface.into(),
            link_kbit: mbps_to_kbps(link_mbps).max(MIN_BEST_EFFORT_KBIT),
            classes: BTreeMap::new(),
            tunnels: BTreeMap::new(),
            applied_classes: BTreeSet::new(),
            applied_filters: BTreeSet::new(),
            root_applied: false,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn policy(&self, slice_id: &str) -> Option<&BandwidthPolicy> {
        self.classes.get(slice_id).map(|c| &c.policy)
    }

    pub fn policies(&self) -> impl Iterator<Item = &BandwidthPolicy> {
        self.classes.values().map(|c| &c.policy)
    }

    /// Class id of a slice, as tc prints it
    pub fn class_id(&self, slice_id: &str) -> Option<String> {
        self.classes.get(slice_id).map(|c| class_id(c.minor))
    }

    /// Insert or replace a slice's class; its class id is kept across updates
    pub fn upsert_policy(&mut self, policy: BandwidthPolicy) -> Result<()> {
        if policy.interface != self.interface {
            return Err(SliceError::InvalidIntent(format!(
                "policy for {} applied to tree of {}",
                policy.interface, self.interface
            )));
        }
        if !policy.guaranteed_mbps.is_finite() || policy.guaranteed_mbps <= 0.0 {
            return Err(SliceError::InvalidIntent(format!(
                "guaranteed rate {} must be positive",
                policy.guaranteed_mbps
            )));
        }
        let minor = match self.classes.get(&policy.slice_id) {
            Some(existing) => existing.minor,
            None => self.free_minor()?,
        };
        self.classes
            .insert(policy.slice_id.clone(), SliceClass { policy, minor });
        Ok(())
    }

    /// Drop a slice's class; its filters stop rendering. True if it was present
    pub fn remove_policy(&mut self, slice_id: &str) -> bool {
        self.classes.remove(slice_id).is_some()
    }

    /// Classify a tunnel's encapsulated traffic into its slice class
    pub fn attach_tunnel(&mut self, vni: Vni, slice_id: &str) -> Result<()> {
        if let Some(entry) = self.tunnels.get_mut(&vni) {
            entry.slice_id = slice_id.to_string();
            return Ok(());
        }
        let id = self.free_filter_id()?;
        self.tunnels.insert(
            vni,
            FilterEntry {
                slice_id: slice_id.to_string(),
                id,
            },
        );
        Ok(())
    }

    pub fn detach_tunnel(&mut self, vni: Vni) -> bool {
        self.tunnels.remove(&vni).is_some()
    }

    fn free_minor(&self) -> Result<u16> {
        let used: BTreeSet<u16> = self
            .classes
            .values()
            .map(|c| c.minor)
            .chain(self.applied_classes.iter().copied())
            .collect();
        (FIRST_SLICE_MINOR..=MAX_MINOR)
            .find(|m| !used.contains(m))
            .ok_or_else(|| SliceError::ApplyFailed {
                node: self.interface.clone(),
                reason: "no free HTB class ids".to_string(),
            })
    }

    fn free_filter_id(&self) -> Result<u16> {
        let used: BTreeSet<u16> = self
            .tunnels
            .values()
            .map(|f| f.id)
            .chain(self.applied_filters.iter().copied())
            .collect();
        (1..=MAX_FILTER_ID)
            .find(|id| !used.contains(id))
            .ok_or_else(|| SliceError::ApplyFailed {
                node: self.interface.clone(),
                reason: "no free u32 filter ids".to_string(),
            })
    }

    /// Filters whose slice currently has a class
    fn active_filters(&self) -> Vec<(Vni, &FilterEntry, u16)> {
        self.tunnels
            .iter()
            .filter_map(|(vni, f)| {
                self.classes
                    .get(&f.slice_id)
                    .map(|class| (*vni, f, class.minor))
            })
            .collect()
    }

    /// Commands that converge the interface onto the desired tree
    pub fn render(&self, vxlan_port: u16) -> Vec<CommandSpec> {
        let dev = &self.interface;
        if self.classes.is_empty() {
            if self.root_applied {
                return vec![CommandSpec::new(
                    "tc",
                    ["qdisc", "del", "dev", dev.as_str(), "root"],
                )];
            }
            return Vec::new();
        }

        let guaranteed: u64 = self
            .classes
            .values()
            .map(|c| mbps_to_kbps(c.policy.guaranteed_mbps))
            .sum();
        let best_effort = self
            .link_kbit
            .saturating_sub(guaranteed)
            .max(MIN_BEST_EFFORT_KBIT);

        let mut batch = String::new();
        let _ = writeln!(
            batch,
            "qdisc replace dev {} root handle 1: htb default {:x}",
            dev, DEFAULT_MINOR
        );
        let _ = writeln!(
            batch,
            "class replace dev {} parent 1: classid {} htb rate {}kbit ceil {}kbit",
            dev,
            class_id(ROOT_MINOR),
            self.link_kbit,
            self.link_kbit
        );
        let _ = writeln!(
            batch,
            "class replace dev {} parent {} classid {} htb rate {}kbit ceil {}kbit prio {}",
            dev,
            class_id(ROOT_MINOR),
            class_id(DEFAULT_MINOR),
            best_effort,
            self.link_kbit,
            BEST_EFFORT_PRIO
        );

        for class in self.classes.values() {
            let p = &class.policy;
            let rate = mbps_to_kbps(p.guaranteed_mbps).max(1);
            let ceil = mbps_to_kbps(p.burst_mbps).max(rate).min(self.link_kbit.max(rate));
            let _ = writeln!(
                batch,
                "class replace dev {} parent {} classid {} htb rate {}kbit ceil {}kbit prio {}",
                dev,
                class_id(ROOT_MINOR),
                class_id(class.minor),
                rate,
                ceil,
                p.priority_class.min(BEST_EFFORT_PRIO)
            );
            let _ = writeln!(
                batch,
                "qdisc replace dev {} parent {} handle {:x}: netem {}",
                dev,
                class_id(class.minor),
                class.minor,
                netem_args(p)
            );
        }

        for (vni, filter, minor) in self.active_filters() {
            let _ = writeln!(
                batch,
                "filter replace dev {} parent 1: protocol ip prio {} handle 800::{:x} u32 \
                 match ip protocol 17 0xff match ip dport {} 0xffff \
                 match u32 0x{:08x} 0xffffff00 at 32 flowid {}",
                dev,
                FILTER_PRIO,
                filter.id,
                vxlan_port,
                vni << 8,
                class_id(minor)
            );
        }

        let mut commands =
            vec![CommandSpec::new("tc", ["-force", "-batch", "-"]).with_stdin(batch)];

        let stale = self.stale_deletions();
        if !stale.is_empty() {
            commands.push(CommandSpec::new("tc", ["-force", "-batch", "-"]).with_stdin(stale));
        }
        commands
    }

    /// Deletions for applied filters and classes no longer desired
    fn stale_deletions(&self) -> String {
        let dev = &self.interface;
        let live_filters: BTreeSet<u16> =
            self.active_filters().iter().map(|(_, f, _)| f.id).collect();
        let live_classes: BTreeSet<u16> = self.classes.values().map(|c| c.minor).collect();

        let mut out = String::new();
        for id in self.applied_filters.difference(&live_filters) {
            let _ = writeln!(
                out,
                "filter del dev {} parent 1: protocol ip prio {} handle 800::{:x} u32",
                dev, FILTER_PRIO, id
            );
        }
        for minor in self.applied_classes.difference(&live_classes) {
            let _ = writeln!(
                out,
                "qdisc del dev {} parent {} handle {:x}:",
                dev,
                class_id(*minor),
                minor
            );
            let _ = writeln!(out, "class del dev {} classid {}", dev, class_id(*minor));
        }
        out
    }

    /// Record that the last render was applied
    pub fn commit(&mut self) {
        self.applied_classes = self.classes.values().map(|c| c.minor).collect();
        self.applied_filters = self.active_filters().iter().map(|(_, f, _)| f.id).collect();
        self.root_applied = !self.classes.is_empty();
    }

    /// Take on what a failed render of `attempted` may have left in the kernel
    ///
    /// `-force` keeps going past a failing line, so any object the attempt
    /// named may exist now. They count as applied until a later render
    /// deletes them.
    pub fn absorb_failed(&mut self, attempted: &ShapingTree) {
        self.applied_classes
            .extend(attempted.classes.values().map(|c| c.minor));
        self.applied_filters
            .extend(attempted.active_filters().iter().map(|(_, f, _)| f.id));
        self.root_applied |= !attempted.classes.is_empty();
    }

    /// True when a render would delete objects no slice owns
    pub fn has_pending_cleanup(&self) -> bool {
        if self.classes.is_empty() {
            return self.root_applied;
        }
        !self.stale_deletions().is_empty()
    }
}

/// True for a command that only deletes shaping objects
pub fn is_deletion(command: &CommandSpec) -> bool {
    match &command.stdin {
        Some(batch) => batch
            .lines()
            .filter(|l| !l.trim().is_empty())
            .all(|l| l.split_whitespace().nth(1) == Some("del")),
        None => command.args.get(1).map(String::as_str) == Some("del"),
    }
}

/// True if every error tc reported is about an object that is already gone
pub fn only_missing_objects(stderr: &str) -> bool {
    let mut errors = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Command failed"))
        .peekable();
    errors.peek().is_some()
        && errors.all(|l| {
            l.contains("No such file or directory")
                || l.contains("Cannot find")
                || l.contains("Cannot delete qdisc with handle of zero")
        })
}

fn class_id(minor: u16) -> String {
    format!("1:{:x}", minor)
}

fn netem_args(policy: &BandwidthPolicy) -> String {
    let mut args = format!("delay {:.1}ms", policy.latency_ms.max(0.0));
    if policy.jitter_ms > 0.0 {
        let _ = write!(args, " {:.1}ms", policy.jitter_ms);
    }
    if policy.loss_rate > 0.0 {
        let _ = write!(args, " loss {:.4}%", (policy.loss_rate * 100.0).min(100.0));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(slice: &str, mbps: f64, prio: u8) -> BandwidthPolicy {
        BandwidthPolicy {
            slice_id: slice.into(),
            site_id: "edge-1".into(),
            node: "node-a".into(),
            interface: "eth0".into(),
            guaranteed_mbps: mbps,
            burst_mbps: mbps * 2.0,
            priority_class: prio,
            latency_ms: 6.3,
            jitter_ms: 1.0,
            loss_rate: 0.00001,
        }
    }

    #[test]
    fn test_render_uses_only_replace_verbs() {
        let mut tree = ShapingTree::new("eth0", 1000.0);
        tree.upsert_policy(policy("urllc-1", 0.93, 1)).unwrap();
        tree.attach_tunnel(1000, "urllc-1").unwrap();

        let commands = tree.render(4789);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args, vec!["-force", "-batch", "-"]);
        let batch = commands[0].stdin.as_deref().unwrap();
        for line in batch.lines() {
            assert!(line.split_whitespace().nth(1) == Some("replace"), "{}", line);
        }
        assert!(batch.contains("classid 1:10 htb rate 930kbit ceil 1860kbit prio 1"));
        assert!(batch.contains("handle 10: netem delay 6.3ms 1.0ms loss 0.0010%"));
        assert!(batch.contains("match u32 0x0003e800 0xffffff00 at 32 flowid 1:10"));
        assert!(batch.contains("classid 1:2 htb rate 999070kbit"));
    }

    #[test]
    fn test_update_keeps_class_id_and_deletes_stale_after() {
        let mut tree = ShapingTree::new("eth0", 100.0);
        tree.upsert_policy(policy("a", 10.0, 3)).unwrap();
        tree.upsert_policy(policy("b", 5.0, 5)).unwrap();
        tree.render(4789);
        tree.commit();
        let a_class = tree.class_id("a").unwrap();

        tree.upsert_policy(policy("a", 20.0, 3)).unwrap();
        assert!(tree.remove_policy("b"));
        assert_eq!(tree.class_id("a").unwrap(), a_class);

        let commands = tree.render(4789);
        assert_eq!(commands.len(), 2);
        let replace = commands[0].stdin.as_deref().unwrap();
        assert!(!replace.contains("1:11 "));
        let stale = commands[1].stdin.as_deref().unwrap();
        assert!(stale.contains("class del dev eth0 classid 1:11"));
        let qdisc_pos = stale.find("qdisc del").unwrap();
        let class_pos = stale.find("class del").unwrap();
        assert!(qdisc_pos < class_pos);

        tree.commit();
        // stale class id is reusable once deleted
        tree.upsert_policy(policy("c", 1.0, 5)).unwrap();
        assert_eq!(tree.class_id("c").unwrap(), "1:11");
    }

    #[test]
    fn test_ceiling_capped_at_link() {
        let mut tree = ShapingTree::new("eth0", 10.0);
        tree.upsert_policy(policy("big", 8.0, 3)).unwrap();
        let batch = tree.render(4789)[0].stdin.clone().unwrap();
        assert!(batch.contains("rate 8000kbit ceil 10000kbit"));
        assert!(batch.contains("classid 1:2 htb rate 2000kbit"));
    }

    #[test]
    fn test_empty_tree_removes_root_once_applied() {
        let mut tree = ShapingTree::new("eth0", 100.0);
        assert!(tree.render(4789).is_empty());
        tree.upsert_policy(policy("a", 1.0, 3)).unwrap();
        tree.commit();
        tree.remove_policy("a");
        let commands = tree.render(4789);
        assert_eq!(commands[0].to_string(), "tc qdisc del dev eth0 root");
        tree.commit();
        assert!(tree.render(4789).is_empty());
    }

    #[test]
    fn test_filters_wait_for_slice_class() {
        let mut tree = ShapingTree::new("eth0", 100.0);
        tree.attach_tunnel(1000, "late").unwrap();
        tree.upsert_policy(policy("other", 1.0, 3)).unwrap();
        let batch = tree.render(4789)[0].stdin.clone().unwrap();
        assert!(!batch.contains("filter"));

        tree.upsert_policy(policy("late", 1.0, 3)).unwrap();
        let batch = tree.render(4789)[0].stdin.clone().unwrap();
        assert!(batch.contains("filter replace"));
    }

    #[test]
    fn test_failed_render_leaves_objects_for_cleanup() {
        let mut tree = ShapingTree::new("eth0", 100.0);
        tree.upsert_policy(policy("a", 1.0, 3)).unwrap();
        tree.commit();

        let snapshot = tree.clone();
        tree.upsert_policy(policy("b", 2.0, 3)).unwrap();
        tree.attach_tunnel(1000, "b").unwrap();
        tree.render(4789);
        let attempted = std::mem::replace(&mut tree, snapshot);
        tree.absorb_failed(&attempted);

        assert!(tree.policy("b").is_none());
        assert!(tree.has_pending_cleanup());
        let commands = tree.render(4789);
        let stale = commands[1].stdin.as_deref().unwrap();
        assert!(stale.contains("class del dev eth0 classid 1:11"));
        assert!(stale.contains("filter del dev eth0 parent 1: protocol ip prio 1 handle 800::1 u32"));
        assert!(is_deletion(&commands[1]));
        assert!(!is_deletion(&commands[0]));

        tree.commit();
        assert!(!tree.has_pending_cleanup());
        // a retry does not collide with the leftover class id
        tree.upsert_policy(policy("b", 2.0, 3)).unwrap();
        assert_eq!(tree.class_id("b").unwrap(), "1:11");
    }

    #[test]
    fn test_only_missing_objects() {
        assert!(only_missing_objects(
            "RTNETLINK answers: No such file or directory\nCommand failed -:2\n"
        ));
        assert!(!only_missing_objects(
            "RTNETLINK answers: No such file or directory\nRTNETLINK answers: Operation not permitted\n"
        ));
        assert!(!only_missing_objects(""));
    }

    #[test]
    fn test_rejects_bad_policy() {
        let mut tree = ShapingTree::new("eth0", 100.0);
        let mut bad = policy("a", 1.0, 3);
        bad.interface = "eth1".into();
        assert!(tree.upsert_policy(bad).is_err());
        assert!(tree.upsert_policy(policy("a", 0.0, 3)).is_err());
    }
}
