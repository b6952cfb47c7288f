pub mod clock;
pub mod crdt;
pub mod event;
pub mod log;
pub mod materializer;
pub mod ops_cache;
pub mod partition;
pub mod protocol;
pub mod ring;
pub mod snapshot_cache;

// develop notes
//
// this crate is the per-partition materializer of a geo-replicated,
// partitioned store: two in-memory caches (committed operations and
// materialized snapshots) that reconstruct replicated values as of an
// arbitrary causal snapshot. the commit log is the source of truth, the
// caches are disposable
//
// the partition is a single state machine over one `Command` enum, driven
// by the `event::Session` loop. there was a temptation to give every
// command its own `OnEvent` impl, but with a fixed command set the enum
// match reads better and the compiler checks exhaustiveness for free
//
// the one deliberate asymmetry: reads never enter the command loop. they
// run on whatever thread the coordinator calls from, against the shared
// tables, and hand any snapshot they want persisted back to the loop as a
// `StoreSs` command. all multi-step mutation (insert-then-bump, gc,
// handoff) stays on the loop, so per-key write/write races cannot happen
// while readers only ever see a prefix they copied under the table guard
//
// the `TxnId` sentinels break the recursion between the two paths: a
// write-triggered gc read runs with `LogReplay`, which routes its own
// writeback through the synchronous in-place path instead of the loop
// that is currently blocked on the write

// cSpell:words clocksi vnode rehydrating crdt preflist bincode
