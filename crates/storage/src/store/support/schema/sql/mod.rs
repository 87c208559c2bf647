#![forbid(unsafe_code)]

mod core;
mod draft_locks;
mod indexes;
mod jobs;
mod runs;

pub(super) fn full_schema_sql() -> String {
    let mut sql = String::new();
    sql.push_str(core::SQL);
    sql.push_str(runs::SQL);
    sql.push_str(jobs::SQL);
    sql.push_str(draft_locks::SQL);
    sql.push_str(indexes::SQL);
    sql
}
