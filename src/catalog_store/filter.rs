//! Typed filter criteria and the predicate combinator used by catalog listings.
//!
//! A [`CatalogFilter`] is turned into a [`Predicate`], which the SQLite store renders
//! into a parameterized `WHERE` clause and the in-memory store evaluates directly.
//! Column names come from closed enums and every value is bound as a positional
//! parameter, so no caller-supplied text ever reaches the SQL string.

use super::error::{CatalogError, CatalogResult};
use super::models::{Datasource, Template};
use chrono::NaiveDate;
use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// Date format used for date columns; lexicographic order equals date order.
pub const DB_DATE_FORMAT: &str = "%Y-%m-%d";

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 1000;

// =============================================================================
// Columns
// =============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextColumn {
    Nombre,
    Autor,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DateColumn {
    FechaCreacion,
    FechaModificacion,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagColumn {
    Activo,
}

impl TextColumn {
    fn sql_name(&self) -> &'static str {
        match self {
            TextColumn::Nombre => "name",
            TextColumn::Autor => "author",
        }
    }
}

impl DateColumn {
    fn sql_name(&self) -> &'static str {
        match self {
            DateColumn::FechaCreacion => "creation_date",
            DateColumn::FechaModificacion => "modification_date",
        }
    }
}

impl FlagColumn {
    fn sql_name(&self) -> &'static str {
        match self {
            FlagColumn::Activo => "active",
        }
    }
}

/// Entities that can be evaluated against a [`Predicate`] in memory.
pub trait Filterable {
    fn text_value(&self, column: TextColumn) -> &str;
    fn date_value(&self, column: DateColumn) -> NaiveDate;
    fn flag_value(&self, column: FlagColumn) -> bool;
}

impl Filterable for Datasource {
    fn text_value(&self, column: TextColumn) -> &str {
        match column {
            TextColumn::Nombre => &self.nombre,
            TextColumn::Autor => &self.autor,
        }
    }

    fn date_value(&self, column: DateColumn) -> NaiveDate {
        match column {
            DateColumn::FechaCreacion => self.fecha_creacion,
            DateColumn::FechaModificacion => self.fecha_modificacion,
        }
    }

    fn flag_value(&self, column: FlagColumn) -> bool {
        match column {
            FlagColumn::Activo => self.activo,
        }
    }
}

impl Filterable for Template {
    fn text_value(&self, column: TextColumn) -> &str {
        match column {
            TextColumn::Nombre => &self.nombre,
            TextColumn::Autor => &self.autor,
        }
    }

    fn date_value(&self, column: DateColumn) -> NaiveDate {
        match column {
            DateColumn::FechaCreacion => self.fecha_creacion,
            DateColumn::FechaModificacion => self.fecha_modificacion,
        }
    }

    fn flag_value(&self, column: FlagColumn) -> bool {
        match column {
            FlagColumn::Activo => self.activo,
        }
    }
}

// =============================================================================
// Criteria
// =============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(try_from = "DateRangeBounds")]
pub struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

#[derive(Deserialize)]
struct DateRangeBounds {
    from: NaiveDate,
    to: NaiveDate,
}

impl TryFrom<DateRangeBounds> for DateRange {
    type Error = CatalogError;

    fn try_from(bounds: DateRangeBounds) -> CatalogResult<Self> {
        DateRange::new(bounds.from, bounds.to)
    }
}

impl DateRange {
    /// Inclusive range `[from, to]`. Fails when `from` is after `to`.
    pub fn new(from: NaiveDate, to: NaiveDate) -> CatalogResult<Self> {
        if from > to {
            return Err(CatalogError::validation(format!(
                "Malformed date range: {} is after {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn to(&self) -> NaiveDate {
        self.to
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

/// Optional criteria for listing datasources or templates. Omitted criteria do not
/// restrict the result; present ones are combined with AND.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogFilter {
    /// Case-insensitive substring of `nombre`.
    pub nombre: Option<String>,
    /// Case-insensitive substring of `autor`.
    pub autor: Option<String>,
    pub fecha_creacion: Option<DateRange>,
    pub fecha_modificacion: Option<DateRange>,
    pub activo: Option<bool>,
}

impl CatalogFilter {
    pub fn with_nombre(mut self, nombre: impl Into<String>) -> Self {
        self.nombre = Some(nombre.into());
        self
    }

    pub fn with_autor(mut self, autor: impl Into<String>) -> Self {
        self.autor = Some(autor.into());
        self
    }

    pub fn with_fecha_creacion(mut self, range: DateRange) -> Self {
        self.fecha_creacion = Some(range);
        self
    }

    pub fn with_fecha_modificacion(mut self, range: DateRange) -> Self {
        self.fecha_modificacion = Some(range);
        self
    }

    pub fn with_activo(mut self, activo: bool) -> Self {
        self.activo = Some(activo);
        self
    }

    pub fn predicate(&self) -> Predicate {
        let mut predicate = Predicate::always();
        if let Some(nombre) = non_blank(&self.nombre) {
            predicate = predicate.and(Predicate::contains_ignore_case(TextColumn::Nombre, nombre));
        }
        if let Some(autor) = non_blank(&self.autor) {
            predicate = predicate.and(Predicate::contains_ignore_case(TextColumn::Autor, autor));
        }
        if let Some(range) = self.fecha_creacion {
            predicate = predicate.and(Predicate::date_between(DateColumn::FechaCreacion, range));
        }
        if let Some(range) = self.fecha_modificacion {
            predicate =
                predicate.and(Predicate::date_between(DateColumn::FechaModificacion, range));
        }
        if let Some(activo) = self.activo {
            predicate = predicate.and(Predicate::flag_equals(FlagColumn::Activo, activo));
        }
        predicate
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

// =============================================================================
// Predicate
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Always,
    /// `needle` is stored already case-folded.
    ContainsIgnoreCase {
        column: TextColumn,
        needle: String,
    },
    DateBetween {
        column: DateColumn,
        range: DateRange,
    },
    FlagEquals {
        column: FlagColumn,
        value: bool,
    },
    And(Vec<Predicate>),
}

/// A bound SQL parameter produced by [`Predicate::to_sql`].
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
            SqlParam::Integer(i) => Ok(ToSqlOutput::from(*i)),
        }
    }
}

/// A `WHERE` clause fragment with numbered placeholders and the values bound to them.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlPredicate {
    pub clause: String,
    pub params: Vec<SqlParam>,
}

impl Predicate {
    pub fn always() -> Self {
        Predicate::Always
    }

    pub fn contains_ignore_case(column: TextColumn, needle: &str) -> Self {
        Predicate::ContainsIgnoreCase {
            column,
            needle: needle.to_lowercase(),
        }
    }

    pub fn date_between(column: DateColumn, range: DateRange) -> Self {
        Predicate::DateBetween { column, range }
    }

    pub fn flag_equals(column: FlagColumn, value: bool) -> Self {
        Predicate::FlagEquals { column, value }
    }

    /// Conjunction of `self` and `other`. `Always` is the identity and nested
    /// conjunctions are flattened.
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::Always, p) | (p, Predicate::Always) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, Predicate::And(mut right)) => {
                right.insert(0, p);
                Predicate::And(right)
            }
            (left, right) => Predicate::And(vec![left, right]),
        }
    }

    /// Render as SQL. Placeholders are numbered from `first_param` (1-based), so the
    /// caller can append further parameters such as `LIMIT`/`OFFSET`.
    pub fn to_sql(&self, first_param: usize) -> SqlPredicate {
        let mut params = Vec::new();
        let clause = self.render(first_param, &mut params);
        SqlPredicate { clause, params }
    }

    fn render(&self, first_param: usize, params: &mut Vec<SqlParam>) -> String {
        let index = first_param + params.len();
        match self {
            Predicate::Always => "1 = 1".to_string(),
            Predicate::ContainsIgnoreCase { column, needle } => {
                params.push(SqlParam::Text(needle.clone()));
                format!("instr(casefold({}), ?{}) > 0", column.sql_name(), index)
            }
            Predicate::DateBetween { column, range } => {
                params.push(SqlParam::Text(range.from.format(DB_DATE_FORMAT).to_string()));
                params.push(SqlParam::Text(range.to.format(DB_DATE_FORMAT).to_string()));
                format!(
                    "{} BETWEEN ?{} AND ?{}",
                    column.sql_name(),
                    index,
                    index + 1
                )
            }
            Predicate::FlagEquals { column, value } => {
                params.push(SqlParam::Integer(*value as i64));
                format!("{} = ?{}", column.sql_name(), index)
            }
            Predicate::And(parts) => {
                if parts.is_empty() {
                    return "1 = 1".to_string();
                }
                let rendered: Vec<String> = parts
                    .iter()
                    .map(|part| format!("({})", part.render(first_param, params)))
                    .collect();
                rendered.join(" AND ")
            }
        }
    }

    pub fn matches<F: Filterable + ?Sized>(&self, entity: &F) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::ContainsIgnoreCase { column, needle } => entity
                .text_value(*column)
                .to_lowercase()
                .contains(needle.as_str()),
            Predicate::DateBetween { column, range } => {
                range.contains(entity.date_value(*column))
            }
            Predicate::FlagEquals { column, value } => entity.flag_value(*column) == *value,
            Predicate::And(parts) => parts.iter().all(|part| part.matches(entity)),
        }
    }
}

// =============================================================================
// Pagination
// =============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageRequest {
    page: u32,
    size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> CatalogResult<Self> {
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(CatalogError::validation(format!(
                "Page size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, size
            )));
        }
        Ok(Self { page, size })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.page as u64 * self.size as u64
    }
}

/// One page of a filtered listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_count: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total_count: u64) -> Self {
        Self {
            items,
            page_number: request.page,
            page_size: request.size,
            total_count,
        }
    }

    /// Paginate an already filtered, already ordered list.
    pub fn from_matches(matches: Vec<T>, request: PageRequest) -> Self {
        let total_count = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.size as usize)
            .collect();
        Self::new(items, request, total_count)
    }
}
