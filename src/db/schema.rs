//! Database schema definitions
//!
//! Timestamps are unix milliseconds. History dates are `YYYY-MM-DD` strings in
//! the configured local timezone.

pub const CREATE_SOURCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL UNIQUE,
    service_name TEXT NOT NULL,
    custom_name TEXT,
    first_seen BIGINT NOT NULL,
    last_seen BIGINT NOT NULL
)
"#;

// live_* columns are only maintained in live_counters mode
pub const CREATE_PORT_ENTITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS port_entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 0,
    custom_name TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    last_updated BIGINT,
    live_up BIGINT NOT NULL DEFAULT 0,
    live_down BIGINT NOT NULL DEFAULT 0,
    live_date TEXT,
    created_at BIGINT NOT NULL,
    UNIQUE(source_id, tag)
)
"#;

pub const CREATE_CLIENT_ENTITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS client_entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    email TEXT NOT NULL,
    custom_name TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    last_updated BIGINT,
    live_up BIGINT NOT NULL DEFAULT 0,
    live_down BIGINT NOT NULL DEFAULT 0,
    live_date TEXT,
    created_at BIGINT NOT NULL,
    UNIQUE(source_id, email)
)
"#;

pub const CREATE_PORT_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS port_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES port_entities(id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    daily_up BIGINT NOT NULL DEFAULT 0,
    daily_down BIGINT NOT NULL DEFAULT 0,
    UNIQUE(entity_id, date)
)
"#;

pub const CREATE_CLIENT_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS client_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES client_entities(id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    daily_up BIGINT NOT NULL DEFAULT 0,
    daily_down BIGINT NOT NULL DEFAULT 0,
    UNIQUE(entity_id, date)
)
"#;

// Accepted report bodies, kept as received
pub const CREATE_RAW_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS raw_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    client_ip TEXT NOT NULL,
    user_agent TEXT,
    request_body TEXT NOT NULL,
    parsed_data TEXT,
    received_at BIGINT NOT NULL
)
"#;

pub const CREATE_INDEX_PORT_SOURCE: &str =
    "CREATE INDEX IF NOT EXISTS idx_port_entities_source ON port_entities(source_id)";

pub const CREATE_INDEX_CLIENT_SOURCE: &str =
    "CREATE INDEX IF NOT EXISTS idx_client_entities_source ON client_entities(source_id)";

// For "today" lookups across all entities
pub const CREATE_INDEX_PORT_HISTORY_DATE: &str =
    "CREATE INDEX IF NOT EXISTS idx_port_history_date ON port_history(date)";

pub const CREATE_INDEX_CLIENT_HISTORY_DATE: &str =
    "CREATE INDEX IF NOT EXISTS idx_client_history_date ON client_history(date)";

pub const CREATE_INDEX_RAW_REQUESTS_SOURCE: &str = "CREATE INDEX IF NOT EXISTS \
    idx_raw_requests_source_time ON raw_requests(source_id, received_at)";

pub const MIGRATIONS: &[&str] = &[
    CREATE_SOURCES_TABLE,
    CREATE_PORT_ENTITIES_TABLE,
    CREATE_CLIENT_ENTITIES_TABLE,
    CREATE_PORT_HISTORY_TABLE,
    CREATE_CLIENT_HISTORY_TABLE,
    CREATE_RAW_REQUESTS_TABLE,
    CREATE_INDEX_PORT_SOURCE,
    CREATE_INDEX_CLIENT_SOURCE,
    CREATE_INDEX_PORT_HISTORY_DATE,
    CREATE_INDEX_CLIENT_HISTORY_DATE,
    CREATE_INDEX_RAW_REQUESTS_SOURCE,
];

/// Statements that differ between port and client entities only by table and
/// key column. Built at compile time so no identifier is ever spliced at runtime.
pub struct KindQueries {
    pub insert_entity: &'static str,
    pub select_entity_id: &'static str,
    pub upsert_history_add: &'static str,
    pub upsert_history_close: &'static str,
    pub touch_entity: &'static str,
    pub add_live: &'static str,
    pub select_stale_live: &'static str,
    pub reset_stale_live: &'static str,
    pub select_entity: &'static str,
    pub select_entities_by_source: &'static str,
    pub today_history_by_source: &'static str,
    pub today_live_by_source: &'static str,
    pub window_rows: &'static str,
    pub all_rows: &'static str,
    pub totals: &'static str,
    pub rename: &'static str,
    pub delete_history_by_source: &'static str,
    pub delete_entities_by_source: &'static str,
    pub count_active_by_source: &'static str,
}

macro_rules! kind_queries {
    ($entity:literal, $history:literal, $key:literal, $port:literal, $insert:literal) => {
        KindQueries {
            insert_entity: concat!($insert, " ON CONFLICT(source_id, ", $key, ") DO NOTHING"),
            select_entity_id: concat!(
                "SELECT id FROM ", $entity, " WHERE source_id = ? AND ", $key, " = ?"
            ),
            upsert_history_add: concat!(
                "INSERT INTO ", $history, " (entity_id, date, daily_up, daily_down) ",
                "VALUES (?, ?, ?, ?) ",
                "ON CONFLICT(entity_id, date) DO UPDATE SET ",
                "daily_up = daily_up + excluded.daily_up, ",
                "daily_down = daily_down + excluded.daily_down"
            ),
            upsert_history_close: concat!(
                "INSERT INTO ", $history, " (entity_id, date, daily_up, daily_down) ",
                "VALUES (?, ?, ?, ?) ",
                "ON CONFLICT(entity_id, date) DO UPDATE SET ",
                "daily_up = MAX(daily_up, excluded.daily_up), ",
                "daily_down = MAX(daily_down, excluded.daily_down)"
            ),
            touch_entity: concat!("UPDATE ", $entity, " SET last_updated = ? WHERE id = ?"),
            add_live: concat!(
                "UPDATE ", $entity, " SET ",
                "live_up = CASE WHEN live_date = ? THEN live_up + ? ELSE ? END, ",
                "live_down = CASE WHEN live_date = ? THEN live_down + ? ELSE ? END, ",
                "live_date = ? WHERE id = ?"
            ),
            select_stale_live: concat!(
                "SELECT id, ", $key, ", live_up, live_down, live_date FROM ", $entity, " ",
                "WHERE status = 'active' AND live_date IS NOT NULL AND live_date < ? ",
                "AND (live_up != 0 OR live_down != 0)"
            ),
            reset_stale_live: concat!(
                "UPDATE ", $entity, " SET live_up = 0, live_down = 0 ",
                "WHERE status = 'active' AND live_date IS NOT NULL AND live_date < ?"
            ),
            select_entity: concat!(
                "SELECT e.id, e.source_id, s.ip_address, s.service_name, ",
                "e.", $key, ", ", $port, ", e.custom_name, ",
                "e.status, e.last_updated, e.live_up, e.live_down, e.live_date ",
                "FROM ", $entity, " e JOIN sources s ON s.id = e.source_id ",
                "WHERE e.source_id = ? AND e.", $key, " = ?"
            ),
            select_entities_by_source: concat!(
                "SELECT id, ", $key, ", ", $port, ", custom_name, status, last_updated, ",
                "live_up, live_down, live_date ",
                "FROM ", $entity, " WHERE source_id = ? AND status = 'active' ORDER BY ", $key
            ),
            today_history_by_source: concat!(
                "SELECT h.entity_id, SUM(h.daily_up), SUM(h.daily_down) FROM ", $history, " h ",
                "JOIN ", $entity, " e ON e.id = h.entity_id ",
                "WHERE e.source_id = ? AND substr(h.date, 1, 10) = ? GROUP BY h.entity_id"
            ),
            today_live_by_source: concat!(
                "SELECT id, live_up, live_down FROM ", $entity, " ",
                "WHERE source_id = ? AND live_date = ?"
            ),
            window_rows: concat!(
                "SELECT date, daily_up, daily_down FROM ", $history, " ",
                "WHERE entity_id = ? AND substr(date, 1, 10) >= ? AND substr(date, 1, 10) <= ?"
            ),
            all_rows: concat!(
                "SELECT date, daily_up, daily_down FROM ", $history, " WHERE entity_id = ?"
            ),
            totals: concat!(
                "SELECT COALESCE(SUM(daily_up), 0), COALESCE(SUM(daily_down), 0) FROM ", $history,
                " WHERE entity_id = ?"
            ),
            rename: concat!(
                "UPDATE ", $entity, " SET custom_name = ? WHERE source_id = ? AND ", $key, " = ?"
            ),
            delete_history_by_source: concat!(
                "DELETE FROM ", $history, " WHERE entity_id IN ",
                "(SELECT id FROM ", $entity, " WHERE source_id = ?)"
            ),
            delete_entities_by_source: concat!("DELETE FROM ", $entity, " WHERE source_id = ?"),
            count_active_by_source: concat!(
                "SELECT source_id, COUNT(*) FROM ", $entity, " ",
                "WHERE status = 'active' GROUP BY source_id"
            ),
        }
    };
}

// Clients have no port; the port column reads as 0 and is never bound on insert
pub const PORT_QUERIES: KindQueries = kind_queries!(
    "port_entities",
    "port_history",
    "tag",
    "port",
    "INSERT INTO port_entities (source_id, tag, created_at, port) VALUES (?, ?, ?, ?)"
);

pub const CLIENT_QUERIES: KindQueries = kind_queries!(
    "client_entities",
    "client_history",
    "email",
    "0",
    "INSERT INTO client_entities (source_id, email, created_at) VALUES (?, ?, ?)"
);
