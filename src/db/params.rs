//! Parameter binding utilities.
//!
//! Statements are written with `:name` placeholders. Before execution the
//! placeholders are rewritten to MySQL's positional `?` and each one is paired
//! with a [`BoundParam`]. The binding type is decided by the bind name alone:
//! a name starting with [`INT_BIND_PREFIX`] binds as an integer, any other
//! name binds as a string.

use crate::error::{DbError, DbResult};
use crate::models::{NamedParams, Scalar};
use sqlx::MySql;
use sqlx::mysql::MySqlArguments;

/// Bind names starting with this character bind as integers.
pub const INT_BIND_PREFIX: char = '_';

/// A value ready to be bound to a positional placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundParam {
    Null,
    Int(i64),
    Str(String),
}

impl BoundParam {
    /// Apply the bind-name convention to a value.
    pub fn for_name(name: &str, value: &Scalar) -> DbResult<Self> {
        if name.starts_with(INT_BIND_PREFIX) {
            return match value.as_int() {
                Ok(Some(v)) => Ok(Self::Int(v)),
                Ok(None) => Ok(Self::Null),
                Err(_) => Err(DbError::invalid_input(format!(
                    "Parameter ':{}' binds as an integer but got '{}'",
                    name, value
                ))),
            };
        }
        Ok(value.as_text().map(Self::Str).unwrap_or(Self::Null))
    }
}

/// SQL rewritten to positional placeholders with its parameters in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalStatement {
    pub sql: String,
    pub params: Vec<BoundParam>,
}

/// Rewrite `:name` placeholders to `?` and bind their values in order.
///
/// Placeholders inside quoted literals and identifiers are left untouched, as
/// are `::` and `:=`. A name may be used more than once; parameters that no
/// placeholder uses are ignored.
pub fn bind_named(sql: &str, params: &NamedParams) -> DbResult<PositionalStatement> {
    let mut out = String::with_capacity(sql.len());
    let mut bound = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((_, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && q != '`' {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            ':' => match chars.peek() {
                Some(&(_, ':')) => {
                    out.push_str("::");
                    chars.next();
                }
                Some(&(start, n)) if n.is_ascii_alphabetic() || n == '_' => {
                    let mut end = start;
                    while let Some(&(idx, n)) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            end = idx + n.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let name = &sql[start..end];
                    let value = params.get(name).ok_or_else(|| {
                        DbError::invalid_input(format!("No value bound for ':{}'", name))
                    })?;
                    bound.push(BoundParam::for_name(name, value)?);
                    out.push('?');
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }

    Ok(PositionalStatement {
        sql: out,
        params: bound,
    })
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q BoundParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        BoundParam::Null => query.bind(None::<String>),
        BoundParam::Int(v) => query.bind(*v),
        BoundParam::Str(v) => query.bind(v.as_str()),
    }
}
