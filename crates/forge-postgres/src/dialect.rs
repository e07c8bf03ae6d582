//! `SqlDialect` for Postgres: `$N` placeholders, native `JSONB`, `ON CONFLICT` upserts.

use forge_core::backing_store::{IntervalUnit, SqlDialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    fn now(&self) -> String {
        "now()".to_string()
    }

    fn interval(&self, value: i64, unit: IntervalUnit) -> String {
        let unit_str = match unit {
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        };
        format!("now() + interval '{value} {unit_str}'")
    }

    fn insert_or_ignore(&self, table: &str, columns: &[&str]) -> String {
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            columns.join(", "),
            self.placeholders(columns.len())
        )
    }

    fn upsert(&self, table: &str, columns: &[&str], key_columns: &[&str]) -> String {
        let set_clause = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {set_clause}",
            columns.join(", "),
            self.placeholders(columns.len()),
            key_columns.join(", "),
        )
    }

    fn json_set(&self, column: &str, path: &str, param_placeholder: &str) -> String {
        format!("jsonb_set({column}, '{{{path}}}', {param_placeholder})")
    }

    fn auto_increment(&self) -> &'static str {
        "BIGSERIAL"
    }

    fn timestamp_default_now(&self) -> String {
        "TIMESTAMPTZ NOT NULL DEFAULT now()".to_string()
    }

    fn boolean_true(&self) -> &'static str {
        "TRUE"
    }

    fn boolean_false(&self) -> &'static str {
        "FALSE"
    }

    fn table_exists_query(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables WHERE table_name = $1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_one_indexed_dollar_style() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.placeholder(0), "$1");
        assert_eq!(dialect.placeholders(3), "$1, $2, $3");
    }

    #[test]
    fn upsert_excludes_key_columns_from_set_clause() {
        let dialect = PostgresDialect;
        let sql = dialect.upsert("core_schedules", &["name", "next_run_at", "enabled"], &["name"]);
        assert!(sql.contains("ON CONFLICT (name) DO UPDATE SET"));
        assert!(sql.contains("next_run_at = EXCLUDED.next_run_at"));
        assert!(!sql.contains("name = EXCLUDED.name"));
    }
}
