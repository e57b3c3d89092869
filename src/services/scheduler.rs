use std::collections::{HashMap, HashSet};

use crate::models::Priority;

const PRIORITY_WEIGHT: f64 = 100.0;
const AGE_WEIGHT: f64 = 0.5;

/// One queued download as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub id: i64,
    pub priority: Priority,
    pub host: String,
    /// Unix seconds the item entered the queue.
    pub queued_at: i64,
}

/// Snapshot of the constraints the scheduler must honor.
#[derive(Debug, Clone, Default)]
pub struct SchedulerContext {
    pub free_global_slots: usize,
    pub per_host_active: HashMap<String, usize>,
    pub per_host_limit: usize,
    /// Hosts whose breaker is currently OPEN.
    pub open_hosts: HashSet<String>,
    /// Ids already mid-start; selected again would double-spawn.
    pub starting: HashSet<i64>,
}

fn score(item: &QueuedItem, now: i64) -> f64 {
    let age_seconds = (now - item.queued_at).max(0) as f64;
    item.priority.as_i64() as f64 * PRIORITY_WEIGHT + age_seconds * AGE_WEIGHT
}

/// Pick the queued downloads to start right now. Pure: the engine wraps the
/// call in its critical section and performs the actual transitions.
pub fn select_startable(queued: &[QueuedItem], ctx: &SchedulerContext, now: i64) -> Vec<i64> {
    if ctx.free_global_slots == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<&QueuedItem> = queued
        .iter()
        .filter(|item| !ctx.starting.contains(&item.id))
        .collect();
    // Highest score first; insertion order (id) breaks ties.
    candidates.sort_by(|a, b| {
        score(b, now)
            .partial_cmp(&score(a, now))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    let mut selected = Vec::new();
    let mut host_counts = ctx.per_host_active.clone();
    let mut remaining = ctx.free_global_slots;

    for item in candidates {
        if remaining == 0 {
            break;
        }
        if ctx.open_hosts.contains(&item.host) {
            continue;
        }
        let active = host_counts.get(&item.host).copied().unwrap_or(0);
        if active >= ctx.per_host_limit {
            continue;
        }
        *host_counts.entry(item.host.clone()).or_insert(0) += 1;
        remaining -= 1;
        selected.push(item.id);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, priority: Priority, host: &str, queued_at: i64) -> QueuedItem {
        QueuedItem {
            id,
            priority,
            host: host.to_string(),
            queued_at,
        }
    }

    fn ctx(slots: usize) -> SchedulerContext {
        SchedulerContext {
            free_global_slots: slots,
            per_host_limit: 3,
            ..SchedulerContext::default()
        }
    }

    #[test]
    fn higher_priority_wins() {
        let queued = vec![
            item(1, Priority::Low, "h", 100),
            item(2, Priority::High, "h", 100),
            item(3, Priority::Normal, "h", 100),
        ];
        let picked = select_startable(&queued, &ctx(2), 100);
        assert_eq!(picked, vec![2, 3]);
    }

    #[test]
    fn aging_promotes_starved_low_priority_items() {
        // Low has waited 500s: 1*100 + 500*0.5 = 350 beats fresh high (300).
        let queued = vec![
            item(1, Priority::Low, "h", 0),
            item(2, Priority::High, "h", 500),
        ];
        let picked = select_startable(&queued, &ctx(1), 500);
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let queued = vec![
            item(9, Priority::Normal, "h", 50),
            item(4, Priority::Normal, "h", 50),
        ];
        let picked = select_startable(&queued, &ctx(1), 50);
        assert_eq!(picked, vec![4]);
    }

    #[test]
    fn per_host_cap_skips_but_keeps_scanning() {
        let mut context = ctx(2);
        context.per_host_limit = 1;
        context.per_host_active.insert("busy".to_string(), 1);
        let queued = vec![
            item(1, Priority::High, "busy", 100),
            item(2, Priority::Low, "idle", 100),
        ];
        let picked = select_startable(&queued, &context, 100);
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn open_breaker_hosts_are_excluded() {
        let mut context = ctx(2);
        context.open_hosts.insert("down".to_string());
        let queued = vec![
            item(1, Priority::High, "down", 100),
            item(2, Priority::Low, "up", 100),
        ];
        let picked = select_startable(&queued, &context, 100);
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn starting_set_and_slot_budget_are_respected() {
        let mut context = ctx(1);
        context.starting.insert(1);
        let queued = vec![
            item(1, Priority::High, "h", 100),
            item(2, Priority::Normal, "h", 100),
            item(3, Priority::Normal, "h", 100),
        ];
        let picked = select_startable(&queued, &context, 100);
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn no_slots_selects_nothing() {
        let queued = vec![item(1, Priority::High, "h", 100)];
        assert!(select_startable(&queued, &ctx(0), 100).is_empty());
    }

    #[test]
    fn selection_counts_its_own_picks_against_host_caps() {
        let mut context = ctx(3);
        context.per_host_limit = 2;
        let queued = vec![
            item(1, Priority::Normal, "h", 100),
            item(2, Priority::Normal, "h", 100),
            item(3, Priority::Normal, "h", 100),
        ];
        let picked = select_startable(&queued, &context, 100);
        assert_eq!(picked, vec![1, 2]);
    }
}
