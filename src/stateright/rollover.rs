//! Stateright Model for Segment Rollover
//!
//! Exhaustively explores appends, the three rollover steps (seal, create,
//! persist chain), failed metadata writes, crashes and re-initialization:
//! - SINGLE_ACTIVE: the persisted chain has at most one unsealed segment, last
//! - NO_LOST_ACKS: every acknowledged append is in a chained segment
//! - NOTHING_OUTSIDE_CHAIN: unchained backend segments are empty
//! - SEALED_COUNTS_EXACT: sealed counts in the chain match the backend
//! - SEGMENT_BOUNDED: no segment exceeds the entry limit

use stateright::{Model, Property};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct RolloverConfig {
    pub max_entries: u64,
    /// Highest segment id the model may create
    pub max_segment_id: u64,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        RolloverConfig {
            max_entries: 2,
            max_segment_id: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendSegment {
    pub entries: u64,
    pub sealed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChainEntry {
    pub id: u64,
    pub entries: u64,
    pub sealed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    /// Active segment sealed, next not created yet
    Sealed,
    /// Next segment exists in the backend, chain not persisted yet
    Created(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RolloverState {
    pub backend: BTreeMap<u64, BackendSegment>,
    pub chain: Vec<ChainEntry>,
    pub next_segment_id: u64,
    /// Active segment id while the manager is up
    pub active: Option<u64>,
    pub phase: Phase,
    pub acked: u64,
}

impl RolloverState {
    /// Stream right after its first init
    pub fn new() -> Self {
        let mut backend = BTreeMap::new();
        backend.insert(0, BackendSegment { entries: 0, sealed: false });
        RolloverState {
            backend,
            chain: vec![ChainEntry { id: 0, entries: 0, sealed: false }],
            next_segment_id: 1,
            active: Some(0),
            phase: Phase::Idle,
            acked: 0,
        }
    }

    fn chained(&self, id: u64) -> bool {
        self.chain.iter().any(|c| c.id == id)
    }

    /// Id the next create lands on: an empty unsealed orphan is adopted,
    /// occupied ids are skipped
    fn next_free_id(&self) -> u64 {
        let mut id = self.next_segment_id;
        while let Some(seg) = self.backend.get(&id) {
            if seg.entries == 0 && !seg.sealed {
                break;
            }
            id += 1;
        }
        id
    }

    fn seal_active_in_chain(&mut self) -> bool {
        let Some(last) = self.chain.last().map(|c| c.id) else {
            return false;
        };
        let Some(seg) = self.backend.get(&last).copied() else {
            return false;
        };
        if let Some(entry) = self.chain.last_mut() {
            entry.sealed = true;
            entry.entries = seg.entries;
        }
        true
    }

    fn push_chain(&mut self, id: u64) {
        self.chain.push(ChainEntry { id, entries: 0, sealed: false });
        self.next_segment_id = self.next_segment_id.max(id + 1);
    }
}

impl Default for RolloverState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RolloverAction {
    Append,
    Seal,
    CreateNext,
    PersistChain,
    /// CAS write lost to a backend failure
    PersistFails,
    Crash,
    Init,
}

pub struct RolloverModel {
    pub config: RolloverConfig,
}

impl RolloverModel {
    pub fn new() -> Self {
        RolloverModel {
            config: RolloverConfig::default(),
        }
    }

    pub fn with_config(config: RolloverConfig) -> Self {
        RolloverModel { config }
    }
}

impl Default for RolloverModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for RolloverModel {
    type State = RolloverState;
    type Action = RolloverAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![RolloverState::new()]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        let Some(active) = state.active else {
            actions.push(RolloverAction::Init);
            return;
        };
        actions.push(RolloverAction::Crash);

        let seg = state.backend.get(&active).copied();
        match state.phase {
            Phase::Idle => {
                if let Some(seg) = seg {
                    if !seg.sealed && seg.entries < self.config.max_entries {
                        actions.push(RolloverAction::Append);
                    } else if state.next_free_id() <= self.config.max_segment_id {
                        actions.push(RolloverAction::Seal);
                    }
                }
            }
            Phase::Sealed => actions.push(RolloverAction::CreateNext),
            Phase::Created(_) => {
                actions.push(RolloverAction::PersistChain);
                actions.push(RolloverAction::PersistFails);
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            RolloverAction::Append => {
                let active = next.active?;
                let seg = next.backend.get_mut(&active)?;
                if seg.sealed || seg.entries >= self.config.max_entries {
                    return None;
                }
                seg.entries += 1;
                next.acked += 1;
            }

            RolloverAction::Seal => {
                let active = next.active?;
                next.backend.get_mut(&active)?.sealed = true;
                next.phase = Phase::Sealed;
            }

            RolloverAction::CreateNext => {
                let id = next.next_free_id();
                if id > self.config.max_segment_id {
                    return None;
                }
                next.backend
                    .entry(id)
                    .or_insert(BackendSegment { entries: 0, sealed: false });
                next.phase = Phase::Created(id);
            }

            RolloverAction::PersistChain => {
                let Phase::Created(id) = next.phase else {
                    return None;
                };
                if !next.seal_active_in_chain() {
                    return None;
                }
                next.push_chain(id);
                next.active = Some(id);
                next.phase = Phase::Idle;
            }

            RolloverAction::PersistFails => {
                // Old segment stays active (and sealed); the next append
                // retries the rollover
                next.phase = Phase::Idle;
            }

            RolloverAction::Crash => {
                next.active = None;
                next.phase = Phase::Idle;
            }

            RolloverAction::Init => {
                if next.active.is_some() {
                    return None;
                }
                let last = next.chain.last().copied()?;
                let sealed_in_backend = next.backend.get(&last.id)?.sealed;
                if !sealed_in_backend {
                    if let Some(entry) = next.chain.last_mut() {
                        entry.entries = next.backend.get(&last.id)?.entries;
                    }
                    next.active = Some(last.id);
                } else {
                    // Interrupted rollover: finish it in one persisted write
                    let id = next.next_free_id();
                    if id > self.config.max_segment_id {
                        return None;
                    }
                    next.backend
                        .entry(id)
                        .or_insert(BackendSegment { entries: 0, sealed: false });
                    next.seal_active_in_chain();
                    next.push_chain(id);
                    next.active = Some(id);
                }
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("single_active", |_: &RolloverModel, state: &RolloverState| {
                let unsealed: Vec<usize> = state
                    .chain
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.sealed)
                    .map(|(i, _)| i)
                    .collect();
                unsealed.is_empty() || unsealed == vec![state.chain.len() - 1]
            }),
            Property::always("no_lost_acks", |_: &RolloverModel, state: &RolloverState| {
                let reachable: u64 = state
                    .chain
                    .iter()
                    .filter_map(|c| state.backend.get(&c.id))
                    .map(|s| s.entries)
                    .sum();
                reachable == state.acked
            }),
            Property::always(
                "nothing_outside_chain",
                |_: &RolloverModel, state: &RolloverState| {
                    state
                        .backend
                        .iter()
                        .all(|(id, seg)| state.chained(*id) || seg.entries == 0)
                },
            ),
            Property::always(
                "sealed_counts_exact",
                |_: &RolloverModel, state: &RolloverState| {
                    state.chain.iter().filter(|c| c.sealed).all(|c| {
                        state
                            .backend
                            .get(&c.id)
                            .map(|s| s.sealed && s.entries == c.entries)
                            .unwrap_or(false)
                    })
                },
            ),
            Property::always("segment_bounded", |model: &RolloverModel, state: &RolloverState| {
                state
                    .backend
                    .values()
                    .all(|s| s.entries <= model.config.max_entries)
            }),
            Property::always("ids_increasing", |_: &RolloverModel, state: &RolloverState| {
                state.chain.windows(2).all(|w| w[0].id < w[1].id)
                    && state.chain.iter().all(|c| c.id < state.next_segment_id)
            }),
            Property::sometimes("three_segment_chain", |_: &RolloverModel, state: &RolloverState| {
                state.chain.len() >= 3
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(model: &RolloverModel, state: &RolloverState, action: RolloverAction) -> RolloverState {
        model.next_state(state, action).unwrap()
    }

    #[test]
    fn test_failed_persist_then_retry_adopts_orphan() {
        let model = RolloverModel::new();
        let mut s = RolloverState::new();
        s = step(&model, &s, RolloverAction::Append);
        s = step(&model, &s, RolloverAction::Append);
        s = step(&model, &s, RolloverAction::Seal);
        s = step(&model, &s, RolloverAction::CreateNext);
        s = step(&model, &s, RolloverAction::PersistFails);
        assert_eq!(s.chain.len(), 1);
        assert!(s.backend.contains_key(&1));

        s = step(&model, &s, RolloverAction::Seal);
        s = step(&model, &s, RolloverAction::CreateNext);
        assert_eq!(s.phase, Phase::Created(1));
        s = step(&model, &s, RolloverAction::PersistChain);
        assert_eq!(s.active, Some(1));
        assert_eq!(s.chain[0].entries, 2);
        assert!(s.chain[0].sealed);
    }

    #[test]
    fn test_crash_after_seal_completed_by_init() {
        let model = RolloverModel::new();
        let mut s = RolloverState::new();
        s = step(&model, &s, RolloverAction::Append);
        s = step(&model, &s, RolloverAction::Append);
        s = step(&model, &s, RolloverAction::Seal);
        s = step(&model, &s, RolloverAction::Crash);
        s = step(&model, &s, RolloverAction::Init);

        assert_eq!(s.active, Some(1));
        assert_eq!(s.chain.len(), 2);
        assert!(s.chain[0].sealed);
        assert!(!s.chain[1].sealed);
    }

    #[test]
    fn test_actions_when_down() {
        let model = RolloverModel::new();
        let mut s = RolloverState::new();
        s = step(&model, &s, RolloverAction::Crash);
        let mut actions = Vec::new();
        model.actions(&s, &mut actions);
        assert_eq!(actions, vec![RolloverAction::Init]);
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_rollover -- --ignored --nocapture
    fn stateright_rollover_model_check() {
        use stateright::Checker;

        let model = RolloverModel::with_config(RolloverConfig {
            max_entries: 2,
            max_segment_id: 3,
        });
        let checker = model.checker().spawn_bfs().join();

        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }
}
