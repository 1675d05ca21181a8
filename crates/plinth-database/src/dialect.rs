//! Supported database vendors and their identifier-quoting rules.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Database vendors the bootstrap can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, IntoStaticStr)]
#[cfg_attr(feature = "config", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DatabaseVendor {
    /// PostgreSQL.
    #[strum(to_string = "postgres", serialize = "postgresql")]
    Postgres,
    /// MySQL and MariaDB.
    #[strum(to_string = "mysql", serialize = "mariadb")]
    Mysql,
    /// Embedded SQLite database file.
    Sqlite,
}

impl DatabaseVendor {
    /// Returns the identifier-quoting convention used when generating SQL for this vendor.
    #[inline]
    pub const fn quoting(self) -> IdentifierQuoting {
        match self {
            Self::Postgres => IdentifierQuoting::Ansi,
            Self::Mysql => IdentifierQuoting::Backtick,
            Self::Sqlite => IdentifierQuoting::Bracket,
        }
    }

    /// Returns whether DDL statements participate in transactions on this vendor.
    ///
    /// MySQL commits implicitly around every DDL statement.
    #[inline]
    pub const fn has_transactional_ddl(self) -> bool {
        !matches!(self, Self::Mysql)
    }

    /// Statement that opens an explicit transaction.
    pub(crate) const fn begin_statement(self) -> &'static str {
        match self {
            Self::Mysql => "START TRANSACTION",
            Self::Postgres => "BEGIN",
            // Takes the write lock up front so the busy timeout applies to it.
            Self::Sqlite => "BEGIN IMMEDIATE",
        }
    }

    /// Renders a string literal for this vendor.
    ///
    /// Single quotes are doubled everywhere; MySQL also treats backslash as an
    /// escape character under its default `sql_mode`.
    pub(crate) fn quote_literal(self, value: &str) -> String {
        let escaped = match self {
            Self::Mysql => value.replace('\\', "\\\\").replace('\'', "''"),
            Self::Postgres | Self::Sqlite => value.replace('\'', "''"),
        };
        format!("'{escaped}'")
    }
}

/// Vendor-specific rule for quoting identifiers in generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum IdentifierQuoting {
    /// SQL standard double quotes: `"name"`.
    Ansi,
    /// MySQL backticks: `` `name` ``.
    Backtick,
    /// SQLite square brackets: `[name]`.
    Bracket,
}

impl IdentifierQuoting {
    /// Quotes a single identifier, escaping the closing delimiter by doubling it.
    pub fn quote(self, identifier: &str) -> String {
        let (open, close) = match self {
            Self::Ansi => ('"', '"'),
            Self::Backtick => ('`', '`'),
            Self::Bracket => ('[', ']'),
        };

        let mut quoted = String::with_capacity(identifier.len() + 2);
        quoted.push(open);
        for ch in identifier.chars() {
            if ch == close {
                quoted.push(close);
            }
            quoted.push(ch);
        }
        quoted.push(close);
        quoted
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_vendor_quoting_conventions() {
        assert_eq!(DatabaseVendor::Postgres.quoting(), IdentifierQuoting::Ansi);
        assert_eq!(DatabaseVendor::Mysql.quoting(), IdentifierQuoting::Backtick);
        assert_eq!(DatabaseVendor::Sqlite.quoting(), IdentifierQuoting::Bracket);
    }

    #[test]
    fn test_quote_escapes_closing_delimiter() {
        assert_eq!(IdentifierQuoting::Ansi.quote("user"), "\"user\"");
        assert_eq!(IdentifierQuoting::Ansi.quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(IdentifierQuoting::Backtick.quote("a`b"), "`a``b`");
        assert_eq!(IdentifierQuoting::Bracket.quote("a]b"), "[a]]b]");
        assert_eq!(IdentifierQuoting::Bracket.quote("a[b"), "[a[b]");
    }

    #[test]
    fn test_vendor_parsing() {
        assert_eq!(
            DatabaseVendor::from_str("PostgreSQL").ok(),
            Some(DatabaseVendor::Postgres)
        );
        assert_eq!(
            DatabaseVendor::from_str("mariadb").ok(),
            Some(DatabaseVendor::Mysql)
        );
        assert_eq!(
            DatabaseVendor::from_str("sqlite").ok(),
            Some(DatabaseVendor::Sqlite)
        );
        assert!(DatabaseVendor::from_str("oracle").is_err());
        assert_eq!(DatabaseVendor::Postgres.to_string(), "postgres");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(DatabaseVendor::Postgres.quote_literal("it's"), "'it''s'");
        assert_eq!(DatabaseVendor::Sqlite.quote_literal(r"a\b"), r"'a\b'");
    }

    #[test]
    fn test_mysql_literal_escapes_backslash() {
        assert_eq!(DatabaseVendor::Mysql.quote_literal(r"host\node"), r"'host\\node'");
        assert_eq!(DatabaseVendor::Mysql.quote_literal(r"o'\"), r"'o''\\'");
    }
}
