//! Pure operation-log reconciliation.
//!
//! Everything in this module is a total function over operation slices; no
//! IO, no state. The application pipeline composes these to fold a batch of
//! remote operations into a stored history: drop what is already present,
//! garbage-collect skip ranges, attach the divergent tail as a branch and
//! merge it back deterministically.
//!
//! Log notation used in the tests: `3:1` is an operation with index 3 and
//! skip 1.

use std::collections::VecDeque;

use crate::document::{DocumentOperations, Operation, Scope};

/// Position a reshuffled range restarts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationIndex {
    pub index: u64,
    pub skip: u64,
}

/// Semantic equality: two operations are the same record if they agree on
/// position, scope, action and the state hash they produced. Caches
/// (`resulting_state`) and timestamps are transport details and do not
/// participate.
pub fn operations_are_equal(a: &Operation, b: &Operation) -> bool {
    a.index == b.index
        && a.skip == b.skip
        && a.scope == b.scope
        && a.action_type == b.action_type
        && a.input == b.input
        && a.hash == b.hash
        && a.id == b.id
}

/// Stable sort by index, ties broken by skip ascending, then timestamp.
pub fn sort_operations(operations: &[Operation]) -> Vec<Operation> {
    let mut sorted = operations.to_vec();
    sorted.sort_by(|a, b| {
        a.index
            .cmp(&b.index)
            .then(a.skip.cmp(&b.skip))
            .then(a.timestamp.cmp(&b.timestamp))
    });
    sorted
}

/// Drops every operation voided by a later skip.
///
/// Walks the sorted log from the tail: each kept operation with skip `s` at
/// index `i` voids all operations with index above `i - s - 1`, so the walk
/// jumps straight to that index. Idempotent.
pub fn garbage_collect(sorted_operations: &[Operation]) -> Vec<Operation> {
    let mut result = VecDeque::with_capacity(sorted_operations.len());

    let mut i = sorted_operations.len() as i64 - 1;
    while i > -1 {
        let op = &sorted_operations[i as usize];
        result.push_front(op.clone());
        let skip_until = op.index as i64 - op.skip as i64 - 1;

        let mut j = i - 1;
        while j > -1 && sorted_operations[j as usize].index as i64 > skip_until {
            j -= 1;
        }
        i = j;
    }

    result.into()
}

/// Sorts and garbage-collects each scope's log.
pub fn garbage_collect_document_operations(operations: &DocumentOperations) -> DocumentOperations {
    let mut cleared = DocumentOperations::default();
    for scope in Scope::ALL {
        *cleared.get_mut(scope) = garbage_collect(&sort_operations(operations.get(scope)));
    }
    cleared
}

/// Total order used to decide where a branch departs from the trunk.
///
/// `a` precedes `b` when its index is lower, or at equal index when both
/// carry the same id and `a` skips less (a later skip supersedes).
pub fn precedes(a: &Operation, b: &Operation) -> bool {
    a.index < b.index || (a.index == b.index && a.id == b.id && a.skip < b.skip)
}

/// Splits incoming operations into the part that extends the trunk in place
/// and the part that diverges.
///
/// Returns `(inverted_trunk, tail)`: `inverted_trunk` is the trunk with the
/// consistent prefix of `new_branch` folded in, `tail` the trunk operations
/// displaced by the divergence. An empty `tail` means no merge is needed.
///
/// ```text
/// [T0:0 T1:0 T2:0 T3:0] + [B4:0 B5:0] = [T0:0 T1:0 T2:0 T3:0 B4:0 B5:0]
/// [T0:0 T1:0 T2:0 T3:0] + [B2:0 B3:0] = [T0:0 T1:0 B2:0 B3:0]
/// ```
pub fn attach_branch(
    trunk: &[Operation],
    new_branch: &[Operation],
) -> (Vec<Operation>, Vec<Operation>) {
    let mut trunk_rest: VecDeque<Operation> = garbage_collect(&sort_operations(trunk)).into();
    let mut new_operations: VecDeque<Operation> =
        garbage_collect(&sort_operations(new_branch)).into();
    if trunk_rest.is_empty() {
        return (new_operations.into(), Vec::new());
    }

    let mut result: Vec<Operation> = Vec::new();
    let mut entered_branch = false;

    while let Some(candidate) = new_operations.front().cloned() {
        let mut next_trunk = trunk_rest.pop_front();
        while let Some(op) = next_trunk {
            if precedes(&op, &candidate) {
                result.push(op);
                next_trunk = trunk_rest.pop_front();
            } else {
                next_trunk = Some(op);
                break;
            }
        }

        match next_trunk {
            None => entered_branch = true,
            Some(op) if !entered_branch => {
                if operations_are_equal(&op, &candidate) {
                    new_operations.pop_front();
                    result.push(op);
                } else {
                    trunk_rest.push_front(op);
                    entered_branch = true;
                }
            }
            Some(op) => trunk_rest.push_front(op),
        }

        if entered_branch {
            while let Some(next) = new_operations.pop_front() {
                result.push(next);
            }
        }
    }

    if !entered_branch {
        while let Some(next) = trunk_rest.pop_front() {
            result.push(next);
        }
    }

    (garbage_collect(&result), trunk_rest.into())
}

/// Splits two sorted, garbage-collected histories into the shared prefix
/// and the two divergent suffixes.
pub fn split(
    sorted_target: &[Operation],
    sorted_merge: &[Operation],
) -> (Vec<Operation>, Vec<Operation>, Vec<Operation>) {
    let mut common = Vec::new();
    let mut target_diff = Vec::new();
    let mut merge_diff = Vec::new();

    let max_len = sorted_target.len().max(sorted_merge.len());
    let mut split_happened = false;
    for i in 0..max_len {
        match (sorted_target.get(i), sorted_merge.get(i)) {
            (Some(target), Some(merge)) => {
                if !split_happened && operations_are_equal(target, merge) {
                    common.push(target.clone());
                } else {
                    split_happened = true;
                    target_diff.push(target.clone());
                    merge_diff.push(merge.clone());
                }
            }
            (Some(target), None) => target_diff.push(target.clone()),
            (None, Some(merge)) => merge_diff.push(merge.clone()),
            (None, None) => {}
        }
    }

    (common, target_diff, merge_diff)
}

/// Orders two concurrent ranges by wall-clock timestamp, stable on ties, and
/// reindexes the result from `start`. The first reindexed operation carries
/// `start.skip` so the combined range voids both original suffixes.
///
/// Clock skew between replicas shifts the resulting order; convergence only
/// holds because every replica applies the same rule to the same inputs.
pub fn reshuffle_by_timestamp(
    start: OperationIndex,
    ops_a: &[Operation],
    ops_b: &[Operation],
) -> Vec<Operation> {
    let mut combined: Vec<Operation> = ops_a.iter().chain(ops_b).cloned().collect();
    combined.sort_by_key(|op| op.timestamp);
    reindex(start, combined)
}

/// Like [`reshuffle_by_timestamp`] but gives the original index priority
/// over the timestamp.
pub fn reshuffle_by_timestamp_and_index(
    start: OperationIndex,
    ops_a: &[Operation],
    ops_b: &[Operation],
) -> Vec<Operation> {
    let mut combined: Vec<Operation> = ops_a.iter().chain(ops_b).cloned().collect();
    combined.sort_by_key(|op| op.timestamp);
    combined.sort_by_key(|op| op.index);
    reindex(start, combined)
}

fn reindex(start: OperationIndex, operations: Vec<Operation>) -> Vec<Operation> {
    operations
        .into_iter()
        .enumerate()
        .map(|(i, mut op)| {
            op.index = start.index + i as u64;
            op.skip = if i == 0 { start.skip } else { 0 };
            op
        })
        .collect()
}

/// Merges two divergent histories into one deterministic log.
///
/// The shared prefix is kept verbatim; the two divergent suffixes are
/// deduplicated by id and handed to `reshuffle`, which appends them as a
/// single reindexed range whose head skip voids both originals.
///
/// ```text
/// [0:0, 1:0, 2:0, A3:0, A4:0, A5:0] + [0:0, 1:0, B4:2, B5:0]
/// Split          => [0:0, 1:0] + [2:0, A3:0, A4:0, A5:0] + [B4:2, B5:0]
/// Reshuffle(6:4) => [6:4, 7:0, 8:0, 9:0, 10:0, 11:0]
/// merge          => [0:0, 1:0, 6:4, 7:0, 8:0, 9:0, 10:0, 11:0]
/// ```
pub fn merge<F>(
    sorted_target: &[Operation],
    sorted_merge: &[Operation],
    reshuffle: F,
) -> Vec<Operation>
where
    F: Fn(OperationIndex, &[Operation], &[Operation]) -> Vec<Operation>,
{
    let (common, target_ops, merge_ops) = split(
        &garbage_collect(sorted_target),
        &garbage_collect(sorted_merge),
    );

    let max_common_index = max_index(&common);
    let next_index = 1 + max_common_index
        .max(max_index(&target_ops))
        .max(max_index(&merge_ops));

    let filtered_merge_ops = filter_duplicated_operations(&merge_ops, &target_ops);

    let start = OperationIndex {
        index: next_index as u64,
        skip: (next_index - (max_common_index + 1)) as u64,
    };
    let reshuffled = reshuffle(start, &target_ops, &filtered_merge_ops);

    let mut result = common;
    result.extend(reshuffled);
    result
}

fn max_index(sorted_operations: &[Operation]) -> i64 {
    sorted_operations
        .last()
        .map(|op| op.index as i64)
        .unwrap_or(-1)
}

/// Drops incoming operations the history already contains.
///
/// A stored operation matches on (index, skip, scope, hash, type); a NOOP
/// with skip 0 is already covered by any stored operation at its index.
pub fn remove_existing_operations(
    new_operations: &[Operation],
    history: &[Operation],
) -> Vec<Operation> {
    new_operations
        .iter()
        .filter(|new_op| {
            !history.iter().any(|stored| {
                (new_op.is_noop() && new_op.skip == 0 && new_op.index == stored.index)
                    || (new_op.index == stored.index
                        && new_op.skip == stored.skip
                        && new_op.scope == stored.scope
                        && new_op.hash == stored.hash
                        && new_op.action_type == stored.action_type)
            })
        })
        .cloned()
        .collect()
}

/// Drops operations from `target` whose id already appears in `source`.
/// Operations without an id are never considered duplicates.
pub fn filter_duplicated_operations(
    target: &[Operation],
    source: &[Operation],
) -> Vec<Operation> {
    target
        .iter()
        .filter(|op| match &op.id {
            Some(id) => !source.iter().any(|other| other.id.as_deref() == Some(id)),
            None => true,
        })
        .cloned()
        .collect()
}

/// Operations in `a` whose index does not appear in `b`. Both inputs are
/// expected garbage-collected.
pub fn diff_operations(a: &[Operation], b: &[Operation]) -> Vec<Operation> {
    a.iter()
        .filter(|op_a| !b.iter().any(|op_b| op_a.index == op_b.index))
        .cloned()
        .collect()
}

/// Skip value for a new undo on top of the log, accumulating across
/// consecutive NOOPs. `-1` when the log cannot be undone further.
///
/// ```text
/// [0:0 1:0]          => 1
/// [0:0 1:0 2:0 2:1]  => 2
/// [0:0 1:1 2:2]      => -1
/// ```
pub fn next_skip_number(sorted_operations: &[Operation]) -> i64 {
    if sorted_operations.is_empty() {
        return -1;
    }

    let cleaned = garbage_collect(sorted_operations);
    let last = match cleaned.last() {
        Some(op) => op,
        None => return -1,
    };

    let mut next_skip = last.skip as i64 + 1;
    if cleaned.len() > 1 {
        next_skip += cleaned[cleaned.len() - 2].skip as i64;
    }

    if (last.index as i64) < next_skip {
        -1
    } else {
        next_skip
    }
}

#[derive(Debug, thiserror::Error)]
#[error("the skip header operation index must be greater than or equal to {last_index}")]
pub struct SkipHeaderError {
    pub last_index: i64,
}

/// Applies a skip header to a log: the operations that survive when a new
/// operation with the given skip lands at `index` (default: next index).
/// The header itself is not part of the result.
pub fn skip_header_operations(
    operations: &[Operation],
    skip: u64,
    index: Option<u64>,
) -> Result<Vec<Operation>, SkipHeaderError> {
    let sorted = sort_operations(operations);
    let last_index = sorted.last().map(|op| op.index as i64).unwrap_or(-1);
    let header_index = index.unwrap_or((last_index + 1) as u64);

    if (header_index as i64) < last_index {
        return Err(SkipHeaderError { last_index });
    }

    let mut with_header = sorted;
    with_header.push(Operation::noop(header_index, skip, Scope::Global, ""));
    let mut cleared = garbage_collect(&sort_operations(&with_header));
    cleared.pop();
    Ok(cleared)
}
