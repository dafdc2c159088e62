pub const BASE_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS votes (
    voter TEXT PRIMARY KEY,
    pools_json TEXT NOT NULL,
    signature TEXT NOT NULL,
    message TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    total_weight INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vote_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    voter TEXT NOT NULL,
    old_pools TEXT NOT NULL,
    new_pools TEXT NOT NULL,
    change_timestamp INTEGER NOT NULL,
    cooldown_until INTEGER NOT NULL,
    change_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vote_history_voter_time
    ON vote_history(voter, change_timestamp DESC);

CREATE TABLE IF NOT EXISTS bindings (
    voter TEXT NOT NULL UNIQUE,
    external TEXT NOT NULL UNIQUE,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pools (
    address TEXT PRIMARY KEY,
    token0 TEXT NOT NULL,
    token1 TEXT NOT NULL,
    fee INTEGER NOT NULL,
    liquidity TEXT NOT NULL,
    symbol0 TEXT,
    symbol1 TEXT
);
"#;
