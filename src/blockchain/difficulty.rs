use super::block::Block;
use super::economics::ChainParams;

/// Difficulty required for the block that would extend `chain`.
///
/// A pure function of the chain: every node holding the same blocks agrees on
/// the value, independent of its wall clock.
pub fn adjust_difficulty(chain: &[Block], params: &ChainParams) -> u32 {
    let interval = params.adjustment_interval;
    if interval == 0 || chain.len() < interval + 1 {
        return params.initial_difficulty;
    }

    let latest = &chain[chain.len() - 1];
    let anchor = &chain[chain.len() - 1 - interval];

    // Timestamps come from peers; arithmetic saturates instead of wrapping
    let actual_time = latest.timestamp.saturating_sub(anchor.timestamp);
    let expected_time = params.block_time.saturating_mul(interval as i64);

    let mut difficulty = latest.difficulty.max(1);
    if actual_time < expected_time / 2 {
        difficulty = difficulty.saturating_add(1);
    } else if actual_time > expected_time.saturating_mul(2) && difficulty > 1 {
        difficulty -= 1;
    }

    difficulty
}
