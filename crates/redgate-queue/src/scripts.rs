//! Atomic queue scripts.
//!
//! Enqueue, dequeue and status updates each run as one server-side script
//! so a task is never visible in two places at once: it sits in exactly
//! one of the scheduled set, the priority index (mirrored in its tenant
//! sub-queue), a running status, a terminal status, or the dead-letter
//! store.
//!
//! Priority index scores are `-priority * 1e12 + seq`, where `seq` is a
//! per-queue insertion counter: higher bands sort first and ties break in
//! insertion order. Both dequeue variants first promote due members of
//! the scheduled set into the live index, which keeps scheduled tasks
//! invisible to workers until their time on either path.

use redgate_connection::ScriptDef;

pub(crate) const ENQUEUE: ScriptDef = ScriptDef {
    name: "queue_enqueue",
    text: r#"-- redgate:queue_enqueue
local priority_key = KEYS[1]
local scheduled_key = KEYS[2]
local seq_key = KEYS[3]
local project_key = KEYS[4]
local task_key = KEYS[5]
local status_key = KEYS[6]

local priority = tonumber(ARGV[1])
local task_json = ARGV[2]
local max_size = tonumber(ARGV[3])
local now_iso = ARGV[4]
local scheduled_ms = tonumber(ARGV[5])

local depth = redis.call('ZCARD', priority_key) + redis.call('ZCARD', scheduled_key)
if depth >= max_size then
    return {0, 'queue_full', depth}
end
local project_depth = redis.call('LLEN', project_key)
if project_depth >= math.floor(max_size / 4) then
    return {0, 'project_queue_full', depth}
end

redis.call('SET', task_key, task_json, 'EX', 86400)

if scheduled_ms > 0 then
    redis.call('ZADD', scheduled_key, scheduled_ms, task_json)
    redis.call('EXPIRE', scheduled_key, 86400)
else
    local seq = redis.call('INCR', seq_key)
    redis.call('ZADD', priority_key, -priority * 1e12 + seq, task_json)
    redis.call('EXPIRE', priority_key, 86400)
    redis.call('RPUSH', project_key, task_json)
    redis.call('EXPIRE', project_key, 86400)
end

redis.call('HSET', status_key, 'status', 'queued', 'queued_at', now_iso)
redis.call('HSETNX', status_key, 'attempts', '0')
redis.call('EXPIRE', status_key, 86400)

return {1, 'queued', depth + 1}
"#,
};

pub(crate) const DEQUEUE: ScriptDef = ScriptDef {
    name: "queue_dequeue",
    text: concat!(
        "-- redgate:queue_dequeue",
        "\n",
        r#"
local function promote_due(priority_key, scheduled_key, seq_key, base_key, now_ms)
    local due = redis.call('ZRANGEBYSCORE', scheduled_key, 0, now_ms)
    for i = 1, #due do
        local task_json = due[i]
        local task = cjson.decode(task_json)
        redis.call('ZREM', scheduled_key, task_json)
        local seq = redis.call('INCR', seq_key)
        redis.call('ZADD', priority_key, -task.priority * 1e12 + seq, task_json)
        redis.call('EXPIRE', priority_key, 86400)
        local project_key = base_key .. ':project:' .. task.project_id
        redis.call('RPUSH', project_key, task_json)
        redis.call('EXPIRE', project_key, 86400)
    end
end

local function pop_global(priority_key, base_key)
    local top = redis.call('ZRANGE', priority_key, 0, 0)
    if #top == 0 then
        return nil
    end
    local task_json = top[1]
    local task = cjson.decode(task_json)
    redis.call('ZREM', priority_key, task_json)
    redis.call('LREM', base_key .. ':project:' .. task.project_id, 1, task_json)
    return task_json
end

local function mark_running(task_prefix, task_json, worker_id, now_iso)
    local task = cjson.decode(task_json)
    local status_key = task_prefix .. task.task_id .. ':status'
    local attempts = tonumber(redis.call('HGET', status_key, 'attempts') or '0') + 1
    redis.call('HSET', status_key,
        'status', 'running',
        'worker_id', worker_id,
        'started_at', now_iso,
        'attempts', tostring(attempts))
    redis.call('EXPIRE', status_key, 86400)
    return attempts
end

local priority_key = KEYS[1]
local scheduled_key = KEYS[2]
local seq_key = KEYS[3]
local base_key = KEYS[4]
local task_prefix = KEYS[5]

local worker_id = ARGV[1]
local now_iso = ARGV[2]
local now_ms = tonumber(ARGV[3])

promote_due(priority_key, scheduled_key, seq_key, base_key, now_ms)

local task_json = pop_global(priority_key, base_key)
if not task_json then
    return {0, 'empty', 0}
end

local attempts = mark_running(task_prefix, task_json, worker_id, now_iso)
return {1, task_json, attempts}
"#
    ),
};

pub(crate) const DEQUEUE_PROJECT: ScriptDef = ScriptDef {
    name: "queue_dequeue_project",
    text: concat!(
        "-- redgate:queue_dequeue_project",
        "\n",
        r#"
local function promote_due(priority_key, scheduled_key, seq_key, base_key, now_ms)
    local due = redis.call('ZRANGEBYSCORE', scheduled_key, 0, now_ms)
    for i = 1, #due do
        local task_json = due[i]
        local task = cjson.decode(task_json)
        redis.call('ZREM', scheduled_key, task_json)
        local seq = redis.call('INCR', seq_key)
        redis.call('ZADD', priority_key, -task.priority * 1e12 + seq, task_json)
        redis.call('EXPIRE', priority_key, 86400)
        local project_key = base_key .. ':project:' .. task.project_id
        redis.call('RPUSH', project_key, task_json)
        redis.call('EXPIRE', project_key, 86400)
    end
end

local function pop_global(priority_key, base_key)
    local top = redis.call('ZRANGE', priority_key, 0, 0)
    if #top == 0 then
        return nil
    end
    local task_json = top[1]
    local task = cjson.decode(task_json)
    redis.call('ZREM', priority_key, task_json)
    redis.call('LREM', base_key .. ':project:' .. task.project_id, 1, task_json)
    return task_json
end

local function mark_running(task_prefix, task_json, worker_id, now_iso)
    local task = cjson.decode(task_json)
    local status_key = task_prefix .. task.task_id .. ':status'
    local attempts = tonumber(redis.call('HGET', status_key, 'attempts') or '0') + 1
    redis.call('HSET', status_key,
        'status', 'running',
        'worker_id', worker_id,
        'started_at', now_iso,
        'attempts', tostring(attempts))
    redis.call('EXPIRE', status_key, 86400)
    return attempts
end

local priority_key = KEYS[1]
local scheduled_key = KEYS[2]
local seq_key = KEYS[3]
local base_key = KEYS[4]
local task_prefix = KEYS[5]
local project_key = KEYS[6]

local worker_id = ARGV[1]
local now_iso = ARGV[2]
local now_ms = tonumber(ARGV[3])

promote_due(priority_key, scheduled_key, seq_key, base_key, now_ms)

local task_json = redis.call('LPOP', project_key)
if task_json then
    redis.call('ZREM', priority_key, task_json)
else
    task_json = pop_global(priority_key, base_key)
end

if not task_json then
    return {0, 'empty', 0}
end

local attempts = mark_running(task_prefix, task_json, worker_id, now_iso)
return {1, task_json, attempts}
"#
    ),
};

pub(crate) const COMPLETE: ScriptDef = ScriptDef {
    name: "queue_complete",
    text: r#"-- redgate:queue_complete
local status_key = KEYS[1]

local status = ARGV[1]
local now_iso = ARGV[2]
local result = ARGV[3]
local err = ARGV[4]
local worker_id = ARGV[5]

redis.call('HSET', status_key, 'status', status)
if status == 'completed' or status == 'failed' or status == 'cancelled' or status == 'dead_letter' then
    redis.call('HSET', status_key, 'completed_at', now_iso)
end
if result ~= '' then
    redis.call('HSET', status_key, 'result', result)
end
if err ~= '' then
    redis.call('HSET', status_key, 'error', err)
end
if worker_id ~= '' then
    redis.call('HSET', status_key, 'worker_id', worker_id)
end
redis.call('EXPIRE', status_key, 86400)

return {1, status}
"#,
};

pub(crate) const CANCEL: ScriptDef = ScriptDef {
    name: "queue_cancel",
    text: r#"-- redgate:queue_cancel
local priority_key = KEYS[1]
local scheduled_key = KEYS[2]
local base_key = KEYS[3]
local task_key = KEYS[4]
local status_key = KEYS[5]

local now_iso = ARGV[1]

local task_json = redis.call('GET', task_key)
if not task_json then
    return {0, 'not_found'}
end
local task = cjson.decode(task_json)

local removed = redis.call('ZREM', priority_key, task_json)
    + redis.call('ZREM', scheduled_key, task_json)
redis.call('LREM', base_key .. ':project:' .. task.project_id, 1, task_json)

if removed == 0 then
    return {0, 'not_queued'}
end

redis.call('HSET', status_key, 'status', 'cancelled', 'completed_at', now_iso)
redis.call('EXPIRE', status_key, 86400)

return {1, 'cancelled'}
"#,
};

/// The full script set the queue registers with its executor.
pub(crate) const ALL: [ScriptDef; 5] = [ENQUEUE, DEQUEUE, DEQUEUE_PROJECT, COMPLETE, CANCEL];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_script_carries_its_marker() {
        for def in ALL {
            let marker = format!("-- redgate:{}", def.name);
            assert!(
                def.text.trim_start().starts_with(&marker),
                "{} is missing marker {marker}",
                def.name
            );
        }
    }
}
