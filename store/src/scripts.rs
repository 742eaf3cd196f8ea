//! Atomic server-side operations.
//!
//! Every shared counter or pool mutation executes as one Lua EVAL so that
//! concurrent allocators in separate processes never interleave a
//! read-then-write sequence. Scripts are cached by the redis crate through
//! their SHA after the first invocation.

use std::sync::LazyLock;

use redis::Script;

/// Pop the lowest recycled number, or advance the counter.
///
/// KEYS[1] = recycle pool (sorted set, score = number)
/// KEYS[2] = allocation counter
pub static ALLOCATE_OR_RECYCLE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if popped[1] then
    return tonumber(popped[1])
end
return redis.call('INCR', KEYS[2])
"#,
    )
});

/// Return a number to the recycle pool, dropping the base id's letter pool
/// in the same unit (cascading release).
///
/// KEYS[1] = recycle pool
/// KEYS[2] = letter pool of the released base id
/// ARGV[1] = number
pub static RELEASE_NUMBER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
redis.call('ZADD', KEYS[1], tonumber(ARGV[1]), ARGV[1])
redis.call('DEL', KEYS[2])
return 1
"#,
    )
});

/// Remove a number from the recycle pool without allocating, advancing the
/// counter past it so later allocations cannot collide with imported ids.
///
/// KEYS[1] = recycle pool
/// KEYS[2] = allocation counter
/// ARGV[1] = number
pub static CLAIM_NUMBER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if tonumber(ARGV[1]) > current then
    redis.call('SET', KEYS[2], ARGV[1])
end
return removed
"#,
    )
});

/// Reserve the lowest unused slot letter A-Z for a base id. Returns the
/// letter, or false once all 26 are in use.
///
/// KEYS[1] = letter pool (set)
pub static ALLOCATE_LETTER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local letters = 'ABCDEFGHIJKLMNOPQRSTUVWXYZ'
for i = 1, 26 do
    local letter = string.sub(letters, i, i)
    if redis.call('SISMEMBER', KEYS[1], letter) == 0 then
        redis.call('SADD', KEYS[1], letter)
        return letter
    end
end
return false
"#,
    )
});

/// Consume one unit of family capacity. Returns the post-decrement count,
/// or -1 when the counter is absent or zero (nothing is mutated). A
/// decrement to zero withdraws the server from the advertiser set.
///
/// KEYS[1] = capacity hash for the family
/// KEYS[2] = advertiser set for the family
/// ARGV[1] = server id
pub static RESERVE_CAPACITY: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local remaining = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '-1')
if remaining <= 0 then
    return -1
end
remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if remaining <= 0 then
    redis.call('SREM', KEYS[2], ARGV[1])
end
return remaining
"#,
    )
});

/// Return one unit of family capacity, re-advertising the server when the
/// counter becomes positive.
///
/// KEYS[1] = capacity hash for the family
/// KEYS[2] = advertiser set for the family
/// ARGV[1] = server id
pub static RELEASE_CAPACITY: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
if remaining > 0 then
    redis.call('SADD', KEYS[2], ARGV[1])
end
return remaining
"#,
    )
});

/// Point a player at a new slot, settling membership sets. Returns the
/// previous slot id or false.
///
/// KEYS[1] = player -> slot hash
/// KEYS[2] = member set of the new slot
/// ARGV[1] = player
/// ARGV[2] = new slot id
/// ARGV[3] = member-set key prefix for the old slot
pub static REASSIGN_PLAYER_SLOT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local previous = redis.call('HGET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[1])
if previous and previous ~= ARGV[2] then
    redis.call('SREM', ARGV[3] .. previous, ARGV[1])
end
return previous
"#,
    )
});

/// Validate and consume a reservation token. Returns 'ok', 'expired', or
/// the conflicting stored value.
///
/// KEYS[1] = reservation key
/// ARGV[1] = expected token value
pub static CONSUME_RESERVATION: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local held = redis.call('GET', KEYS[1])
if not held then
    return 'expired'
end
if held ~= ARGV[1] then
    return held
end
redis.call('DEL', KEYS[1])
return 'ok'
"#,
    )
});
