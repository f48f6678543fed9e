use chrono::Utc;

/// Generate a unique id with a type prefix, e.g. `session_1712345678901_42`.
pub fn new_id(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let rand: u32 = rand::random();
    format!("{}_{}_{}", prefix, ts, rand)
}

/// Extract the prefix back out of an id produced by `new_id`.
pub fn id_prefix(id: &str) -> Option<&str> {
    id.split('_').next().filter(|p| !p.is_empty())
}
