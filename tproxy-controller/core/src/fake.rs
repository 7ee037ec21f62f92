//! An in-memory redirect chain for tests.

use crate::{FirewallRule, RuleStore, RuleTag, StoreError, REDIRECT_PORTS};
use parking_lot::Mutex;
use std::{
    net::IpAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

/// A [`RuleStore`] backed by a vector of rows that renumbers on removal like a real chain.
#[derive(Debug, Default)]
pub struct FakeTable {
    state: Mutex<State>,
    mutation_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub source: IpAddr,
    pub dport: u16,
    pub tag: RuleTag,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Inspect(RuleTag),
    Add(IpAddr, RuleTag),
    Remove(u32),
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<Row>,
    calls: Vec<Call>,
    fail_inspect: bool,
    fail_add: bool,
    fail_remove: Option<u32>,
}

struct InFlight<'a>(&'a AtomicUsize);

// === impl FakeTable ===

impl FakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let table = Self::default();
        table.state.lock().rows.extend(rows);
        table
    }

    /// Mutations sleep for `delay` while counted as in flight.
    pub fn with_mutation_delay(mut self, delay: Duration) -> Self {
        self.mutation_delay = Some(delay);
        self
    }

    pub fn fail_inspect(&self, fail: bool) {
        self.state.lock().fail_inspect = fail;
    }

    pub fn fail_add(&self, fail: bool) {
        self.state.lock().fail_add = fail;
    }

    pub fn fail_remove(&self, position: Option<u32>) {
        self.state.lock().fail_remove = position;
    }

    pub fn rows(&self) -> Vec<Row> {
        self.state.lock().rows.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Returns the recorded calls that change the table.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Inspect(_)))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn mutation(&self, call: Call) -> InFlight<'_> {
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        self.state.lock().calls.push(call);
        let guard = InFlight(&self.in_flight);
        if let Some(delay) = self.mutation_delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

fn injected(op: &str) -> StoreError {
    StoreError::Exit {
        command: format!("fake {op}"),
        status: "exit status: 1".to_string(),
        stderr: "injected failure".to_string(),
    }
}

#[async_trait::async_trait]
impl RuleStore for FakeTable {
    async fn inspect(&self, tag: &RuleTag) -> Result<Vec<FirewallRule>, StoreError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Inspect(tag.clone()));
        if state.fail_inspect {
            return Err(injected("inspect"));
        }
        let mut rules = state
            .rows
            .iter()
            .zip(1u32..)
            .filter(|(row, _)| row.tag == *tag)
            .map(|(row, position)| FirewallRule {
                position,
                tag: row.tag.clone(),
                source: Some(row.source),
                dport: Some(row.dport),
            })
            .collect::<Vec<_>>();
        rules.reverse();
        Ok(rules)
    }

    async fn add(&self, ip: IpAddr, tag: &RuleTag) -> Result<(), StoreError> {
        let _guard = self.mutation(Call::Add(ip, tag.clone())).await;
        let mut state = self.state.lock();
        if state.fail_add {
            return Err(injected("add"));
        }
        for dport in REDIRECT_PORTS {
            state.rows.push(Row {
                source: ip,
                dport,
                tag: tag.clone(),
            });
        }
        Ok(())
    }

    async fn remove(&self, position: u32) -> Result<(), StoreError> {
        let _guard = self.mutation(Call::Remove(position)).await;
        let mut state = self.state.lock();
        if state.fail_remove == Some(position) {
            return Err(injected("remove"));
        }
        let index = match (position as usize).checked_sub(1) {
            Some(i) if i < state.rows.len() => i,
            _ => {
                return Err(StoreError::Exit {
                    command: "fake remove".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("Index of deletion too big: {position}"),
                })
            }
        };
        state.rows.remove(index);
        Ok(())
    }
}

// === impl Row ===

impl Row {
    pub fn new(source: IpAddr, dport: u16, tag: RuleTag) -> Self {
        Self { source, dport, tag }
    }
}

// === impl InFlight ===

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
