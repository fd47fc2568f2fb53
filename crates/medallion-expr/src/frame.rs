//! In-memory, row-oriented dataframe.
//!
//! Cells are `serde_json::Value`s, so nested records (structs) and arrays flow
//! through unchanged and dotted column paths can navigate into them.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use medallion_types::{MedallionError, Result};

use crate::ast::{Expr, Projection, SelectQuery};
use crate::dtype::{float_value, DataType};
use crate::eval::{as_bool, evaluate, total_cmp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinHow {
    #[default]
    Inner,
    Left,
    Right,
    #[serde(alias = "full", alias = "full_outer")]
    Outer,
    #[serde(alias = "left_semi")]
    Semi,
    #[serde(alias = "left_anti")]
    Anti,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    #[serde(alias = "avg")]
    Mean,
    Min,
    Max,
    First,
}

/// One output column of a group-by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Input column; `None` only for `count` over all rows.
    pub column: Option<String>,
    pub func: AggFunc,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataFrame {
    fields: Vec<Field>,
    rows: Vec<Vec<Value>>,
}

fn frame_error(message: impl Into<String>) -> MedallionError {
    MedallionError::EvalError(message.into())
}

/// Hashable key for a tuple of values. Integral doubles collapse onto integers
/// so that `1` and `1.0` group together.
fn key_of<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    let normalized: Vec<Value> = values
        .into_iter()
        .map(|v| match v {
            Value::Number(n) if n.is_f64() => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
                _ => v.clone(),
            },
            other => other.clone(),
        })
        .collect();
    Value::Array(normalized).to_string()
}

impl DataFrame {
    /// Build a dataframe from a schema and rows; every row must match the schema width.
    pub fn new(fields: Vec<Field>, rows: Vec<Vec<Value>>) -> Result<Self> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != fields.len())
        {
            return Err(frame_error(format!(
                "row {i} has {} value(s), expected {}",
                row.len(),
                fields.len()
            )));
        }
        Ok(Self { fields, rows })
    }

    /// An empty dataframe with the given schema.
    pub fn empty(fields: Vec<Field>) -> Self {
        Self {
            fields,
            rows: Vec::new(),
        }
    }

    /// Build a dataframe from JSON object records. Columns appear in first-seen
    /// order; keys missing from a record are null. Types are inferred.
    pub fn from_records(records: impl IntoIterator<Item = Value>) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut objects: Vec<Map<String, Value>> = Vec::new();
        for record in records {
            match record {
                Value::Object(map) => {
                    for key in map.keys() {
                        if seen.insert(key.clone()) {
                            names.push(key.clone());
                        }
                    }
                    objects.push(map);
                }
                other => {
                    return Err(frame_error(format!(
                        "expected a JSON object record, got {} value",
                        DataType::of(&other)
                    )))
                }
            }
        }
        let rows = objects
            .iter()
            .map(|m| {
                names
                    .iter()
                    .map(|n| m.get(n).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        let fields = names
            .into_iter()
            .map(|n| Field::new(n, DataType::Null))
            .collect();
        let mut df = Self { fields, rows };
        df.infer_types();
        Ok(df)
    }

    /// Rows as JSON objects, columns in schema order.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let map: Map<String, Value> = self
                    .fields
                    .iter()
                    .zip(row)
                    .map(|(f, v)| (f.name.clone(), v.clone()))
                    .collect();
                Value::Object(map)
            })
            .collect()
    }

    fn infer_types(&mut self) {
        for (i, field) in self.fields.iter_mut().enumerate() {
            field.dtype = DataType::infer(self.rows.iter().map(|r| &r[i]));
        }
    }

    pub fn schema(&self) -> &[Field] {
        &self.fields
    }

    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| frame_error(format!("column '{name}' not found")))
    }

    /// All values of one column.
    pub fn column_values(&self, name: &str) -> Result<Vec<Value>> {
        let i = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| r[i].clone()).collect())
    }

    /// Resolve a column path against one row. An exact column name wins over a
    /// dotted path into a struct column; a missing nested key is null.
    fn resolve(&self, row: &[Value], path: &str) -> Option<Value> {
        if let Some(i) = self.column_index(path) {
            return Some(row[i].clone());
        }
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = row[self.column_index(first)?].clone();
        for segment in parts {
            current = match current {
                Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
                _ => Value::Null,
            };
        }
        Some(current)
    }

    /// Evaluate `expr` for every row.
    pub fn eval_column(&self, expr: &Expr) -> Result<Vec<Value>> {
        self.rows
            .iter()
            .map(|row| evaluate(expr, &|path: &str| self.resolve(row, path)))
            .collect()
    }

    fn set_column(&mut self, name: &str, values: Vec<Value>, dtype: DataType) {
        match self.column_index(name) {
            Some(i) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[i] = v;
                }
                self.fields[i].dtype = dtype;
            }
            None => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
                self.fields.push(Field::new(name, dtype));
            }
        }
    }

    /// Add or replace column `name` with the result of `expr`, optionally cast.
    pub fn with_column(&self, name: &str, expr: &Expr, dtype: Option<DataType>) -> Result<Self> {
        let mut values = self.eval_column(expr)?;
        let dtype = match dtype {
            Some(t) => {
                for v in values.iter_mut() {
                    *v = t.cast(v);
                }
                t
            }
            None => DataType::infer(values.iter()),
        };
        let mut out = self.clone();
        out.set_column(name, values, dtype);
        Ok(out)
    }

    /// Evaluate a boolean expression per row. Null results are `None`.
    pub fn predicate(&self, expr: &Expr) -> Result<Vec<Option<bool>>> {
        self.eval_column(expr)?.iter().map(as_bool).collect()
    }

    /// Keep the rows whose mask entry is `true`.
    pub fn filter_mask(&self, mask: &[bool]) -> Self {
        let rows = self
            .rows
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(r, _)| r.clone())
            .collect();
        Self {
            fields: self.fields.clone(),
            rows,
        }
    }

    /// Keep rows where `expr` is true; false and null rows are removed.
    pub fn filter(&self, expr: &Expr) -> Result<Self> {
        let mask: Vec<bool> = self
            .predicate(expr)?
            .into_iter()
            .map(|b| b == Some(true))
            .collect();
        Ok(self.filter_mask(&mask))
    }

    /// Project columns (dotted paths select nested fields).
    pub fn select<S: AsRef<str>>(&self, columns: &[S]) -> Result<Self> {
        let projections = columns
            .iter()
            .map(|c| Projection::Expr {
                expr: Expr::Column(c.as_ref().to_string()),
                alias: None,
            })
            .collect();
        self.query(&SelectQuery {
            projections,
            filter: None,
        })
    }

    /// Remove columns; names that do not exist are ignored.
    pub fn drop_columns<S: AsRef<str>>(&self, columns: &[S]) -> Self {
        let drop: HashSet<&str> = columns.iter().map(|c| c.as_ref()).collect();
        let keep: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !drop.contains(f.name.as_str()))
            .map(|(i, _)| i)
            .collect();
        Self {
            fields: keep.iter().map(|&i| self.fields[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| keep.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        }
    }

    pub fn rename(&self, mapping: &[(String, String)]) -> Result<Self> {
        let mut out = self.clone();
        for (from, to) in mapping {
            let i = out.require_column(from)?;
            if from != to && out.has_column(to) {
                return Err(frame_error(format!(
                    "cannot rename '{from}' to '{to}': column already exists"
                )));
            }
            out.fields[i].name = to.clone();
        }
        Ok(out)
    }

    /// Run a `SELECT` statement: the `WHERE` clause filters input rows, then
    /// projections are evaluated. A later projection with the same output name
    /// replaces an earlier one in place.
    pub fn query(&self, query: &SelectQuery) -> Result<Self> {
        let base = match &query.filter {
            Some(f) => self.filter(f)?,
            None => self.clone(),
        };
        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<Value>> = Vec::new();
        let mut push = |name: String, values: Vec<Value>| {
            match names.iter().position(|n| *n == name) {
                Some(i) => columns[i] = values,
                None => {
                    names.push(name);
                    columns.push(values);
                }
            }
        };
        for (position, projection) in query.projections.iter().enumerate() {
            match projection {
                Projection::Wildcard => {
                    for (i, f) in base.fields.iter().enumerate() {
                        push(f.name.clone(), base.rows.iter().map(|r| r[i].clone()).collect());
                    }
                }
                Projection::Expr { expr, .. } => {
                    let name = projection
                        .output_name(position)
                        .unwrap_or_else(|| format!("_c{position}"));
                    push(name, base.eval_column(expr)?);
                }
            }
        }
        Ok(Self::from_columns(names, columns, base.num_rows()))
    }

    fn from_columns(names: Vec<String>, columns: Vec<Vec<Value>>, num_rows: usize) -> Self {
        let fields = names
            .into_iter()
            .zip(&columns)
            .map(|(n, values)| Field::new(n, DataType::infer(values.iter())))
            .collect();
        let rows = (0..num_rows)
            .map(|r| columns.iter().map(|c| c[r].clone()).collect())
            .collect();
        Self { fields, rows }
    }

    /// Stack two dataframes, aligning columns by name. Columns missing on
    /// either side are filled with null.
    pub fn union_by_name(&self, other: &DataFrame) -> Self {
        let mut fields = self.fields.clone();
        for f in &other.fields {
            match fields.iter_mut().find(|x| x.name == f.name) {
                Some(existing) => existing.dtype = existing.dtype.unify(f.dtype),
                None => fields.push(f.clone()),
            }
        }
        let align = |df: &DataFrame| -> Vec<Vec<Value>> {
            let index: Vec<Option<usize>> =
                fields.iter().map(|f| df.column_index(&f.name)).collect();
            df.rows
                .iter()
                .map(|r| {
                    index
                        .iter()
                        .map(|i| i.map(|i| r[i].clone()).unwrap_or(Value::Null))
                        .collect()
                })
                .collect()
        };
        let mut rows = align(self);
        rows.extend(align(other));
        Self { fields, rows }
    }

    /// Rows from `offset` onward.
    pub fn slice(&self, offset: usize) -> Self {
        Self {
            fields: self.fields.clone(),
            rows: self.rows.iter().skip(offset).cloned().collect(),
        }
    }

    pub fn limit(&self, n: usize) -> Self {
        Self {
            fields: self.fields.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Stable sort. Ascending keys place nulls first.
    pub fn sort(&self, keys: &[SortKey]) -> Result<Self> {
        let key_values: Vec<Vec<Value>> = keys
            .iter()
            .map(|k| self.eval_column(&Expr::Column(k.column.clone())))
            .collect::<Result<_>>()?;
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by(|&a, &b| {
            for (k, values) in keys.iter().zip(&key_values) {
                let o = total_cmp(&values[a], &values[b]);
                let o = if k.descending { o.reverse() } else { o };
                if o != Ordering::Equal {
                    return o;
                }
            }
            Ordering::Equal
        });
        Ok(Self {
            fields: self.fields.clone(),
            rows: order.into_iter().map(|i| self.rows[i].clone()).collect(),
        })
    }

    /// Keep the first row of each distinct key (all columns when `subset` is `None`).
    pub fn distinct(&self, subset: Option<&[String]>) -> Result<Self> {
        let index: Vec<usize> = match subset {
            Some(cols) => cols
                .iter()
                .map(|c| self.require_column(c))
                .collect::<Result<_>>()?,
            None => (0..self.fields.len()).collect(),
        };
        let mut seen = HashSet::new();
        let rows = self
            .rows
            .iter()
            .filter(|r| seen.insert(key_of(index.iter().map(|&i| &r[i]))))
            .cloned()
            .collect();
        Ok(Self {
            fields: self.fields.clone(),
            rows,
        })
    }

    /// Join on equal key columns. Key columns appear once, first, and are
    /// coalesced from both sides; a right column whose name clashes with a left
    /// column gets a `_right` suffix. Null keys never match.
    pub fn join(&self, other: &DataFrame, on: &[String], how: JoinHow) -> Result<Self> {
        if on.is_empty() {
            return Err(frame_error("join requires at least one key column"));
        }
        let left_keys: Vec<usize> = on
            .iter()
            .map(|k| self.require_column(k))
            .collect::<Result<_>>()?;
        let right_keys: Vec<usize> = on
            .iter()
            .map(|k| other.require_column(k))
            .collect::<Result<_>>()?;

        let mut right_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, row) in other.rows.iter().enumerate() {
            if right_keys.iter().any(|&k| row[k].is_null()) {
                continue;
            }
            right_index
                .entry(key_of(right_keys.iter().map(|&k| &row[k])))
                .or_default()
                .push(i);
        }
        let lookup = |row: &[Value]| matching_rows(&right_index, &left_keys, row);

        if matches!(how, JoinHow::Semi | JoinHow::Anti) {
            let keep_matched = how == JoinHow::Semi;
            let rows = self
                .rows
                .iter()
                .filter(|r| lookup(r).is_empty() != keep_matched)
                .cloned()
                .collect();
            return Ok(Self {
                fields: self.fields.clone(),
                rows,
            });
        }

        let left_rest: Vec<usize> = (0..self.fields.len())
            .filter(|i| !left_keys.contains(i))
            .collect();
        let right_rest: Vec<usize> = (0..other.fields.len())
            .filter(|i| !right_keys.contains(i))
            .collect();

        let mut fields: Vec<Field> = left_keys
            .iter()
            .zip(&right_keys)
            .map(|(&l, &r)| {
                Field::new(
                    self.fields[l].name.clone(),
                    self.fields[l].dtype.unify(other.fields[r].dtype),
                )
            })
            .collect();
        fields.extend(left_rest.iter().map(|&i| self.fields[i].clone()));
        for &i in &right_rest {
            let f = &other.fields[i];
            let name = if self.has_column(&f.name) {
                format!("{}_right", f.name)
            } else {
                f.name.clone()
            };
            fields.push(Field::new(name, f.dtype));
        }

        let build = |left: Option<&Vec<Value>>, right: Option<&Vec<Value>>| -> Vec<Value> {
            let mut row = Vec::with_capacity(fields.len());
            for (&l, &r) in left_keys.iter().zip(&right_keys) {
                let lv = left.map(|x| &x[l]).filter(|v| !v.is_null());
                let rv = right.map(|x| &x[r]);
                row.push(lv.or(rv).cloned().unwrap_or(Value::Null));
            }
            for &i in &left_rest {
                row.push(left.map(|x| x[i].clone()).unwrap_or(Value::Null));
            }
            for &i in &right_rest {
                row.push(right.map(|x| x[i].clone()).unwrap_or(Value::Null));
            }
            row
        };

        let mut rows = Vec::new();
        let mut right_matched = vec![false; other.rows.len()];
        for left in &self.rows {
            let matches = lookup(left);
            if matches.is_empty() {
                if matches!(how, JoinHow::Left | JoinHow::Outer) {
                    rows.push(build(Some(left), None));
                }
                continue;
            }
            for &m in matches {
                right_matched[m] = true;
                rows.push(build(Some(left), Some(&other.rows[m])));
            }
        }
        if matches!(how, JoinHow::Right | JoinHow::Outer) {
            for (i, right) in other.rows.iter().enumerate() {
                if !right_matched[i] {
                    rows.push(build(None, Some(right)));
                }
            }
        }
        tracing::debug!(
            how = ?how,
            left_rows = self.num_rows(),
            right_rows = other.num_rows(),
            rows = rows.len(),
            "join complete"
        );
        Ok(Self { fields, rows })
    }

    /// Group rows by `keys` (in first-seen order) and compute `aggs` per group.
    /// With no keys the whole frame is one group.
    pub fn group_by(&self, keys: &[String], aggs: &[Aggregation]) -> Result<Self> {
        let key_index: Vec<usize> = keys
            .iter()
            .map(|k| self.require_column(k))
            .collect::<Result<_>>()?;
        let agg_index: Vec<Option<usize>> = aggs
            .iter()
            .map(|a| match &a.column {
                Some(c) => self.require_column(c).map(Some),
                None if a.func == AggFunc::Count => Ok(None),
                None => Err(frame_error(format!(
                    "aggregation '{}' requires a column",
                    a.alias
                ))),
            })
            .collect::<Result<_>>()?;

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut lookup: HashMap<String, usize> = HashMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key = key_of(key_index.iter().map(|&k| &row[k]));
            let g = *lookup.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[g].push(i);
        }
        if keys.is_empty() && groups.is_empty() {
            groups.push(Vec::new());
        }

        let mut rows = Vec::with_capacity(groups.len());
        for members in &groups {
            let mut row: Vec<Value> = match members.first() {
                Some(&first) => key_index.iter().map(|&k| self.rows[first][k].clone()).collect(),
                None => Vec::new(),
            };
            for (agg, col) in aggs.iter().zip(&agg_index) {
                let values: Vec<&Value> = match col {
                    Some(c) => members.iter().map(|&m| &self.rows[m][*c]).collect(),
                    None => Vec::new(),
                };
                row.push(aggregate(agg, col.is_none(), members.len(), &values)?);
            }
            rows.push(row);
        }

        let mut fields: Vec<Field> = key_index.iter().map(|&k| self.fields[k].clone()).collect();
        fields.extend(aggs.iter().map(|a| Field::new(a.alias.clone(), DataType::Null)));
        let mut df = Self { fields, rows };
        df.infer_types();
        Ok(df)
    }
}

fn matching_rows<'a>(
    index: &'a HashMap<String, Vec<usize>>,
    keys: &[usize],
    row: &[Value],
) -> &'a [usize] {
    if keys.iter().any(|&k| row[k].is_null()) {
        return &[];
    }
    index
        .get(&key_of(keys.iter().map(|&k| &row[k])))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn aggregate(agg: &Aggregation, all_rows: bool, group_len: usize, values: &[&Value]) -> Result<Value> {
    let non_null = || values.iter().copied().filter(|v| !v.is_null());
    match agg.func {
        AggFunc::Count => {
            let n = if all_rows { group_len } else { non_null().count() };
            Ok(Value::from(n as i64))
        }
        AggFunc::Sum | AggFunc::Mean => {
            let mut int_sum: Option<i64> = Some(0);
            let mut float_sum = 0.0;
            let mut n = 0usize;
            for v in non_null() {
                let Value::Number(num) = v else {
                    return Err(frame_error(format!(
                        "cannot aggregate {} values in '{}'",
                        DataType::of(v),
                        agg.alias
                    )));
                };
                int_sum = match (int_sum, num.as_i64()) {
                    (Some(acc), Some(i)) => acc.checked_add(i),
                    _ => None,
                };
                float_sum += num.as_f64().unwrap_or(0.0);
                n += 1;
            }
            if n == 0 {
                return Ok(Value::Null);
            }
            if agg.func == AggFunc::Mean {
                return Ok(float_value(float_sum / n as f64));
            }
            Ok(int_sum.map(Value::from).unwrap_or_else(|| float_value(float_sum)))
        }
        AggFunc::Min => Ok(non_null()
            .min_by(|a, b| total_cmp(a, b))
            .cloned()
            .unwrap_or(Value::Null)),
        AggFunc::Max => Ok(non_null()
            .max_by(|a, b| total_cmp(a, b))
            .cloned()
            .unwrap_or(Value::Null)),
        AggFunc::First => Ok(values.first().map(|v| (*v).clone()).unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_expr, parse_query};
    use serde_json::json;

    fn prices() -> DataFrame {
        DataFrame::from_records(vec![
            json!({"symbol": "AAPL", "open": 5, "close": 6.0}),
            json!({"symbol": "MSFT", "open": -1, "close": 2.0}),
            json!({"symbol": "AAPL", "open": null, "close": 7.5}),
        ])
        .unwrap()
    }

    #[test]
    fn from_records_infers_schema() {
        let df = prices();
        assert_eq!(df.columns(), vec!["symbol", "open", "close"]);
        assert_eq!(df.schema()[0].dtype, DataType::String);
        assert_eq!(df.schema()[1].dtype, DataType::Integer);
        assert_eq!(df.schema()[2].dtype, DataType::Double);
        assert_eq!(df.num_rows(), 3);
    }

    #[test]
    fn from_records_fills_missing_keys() {
        let df = DataFrame::from_records(vec![json!({"a": 1}), json!({"b": 2})]).unwrap();
        assert_eq!(df.columns(), vec!["a", "b"]);
        assert_eq!(df.to_records()[1], json!({"a": null, "b": 2}));
        assert!(DataFrame::from_records(vec![json!(1)]).is_err());
    }

    #[test]
    fn new_checks_row_width() {
        let fields = vec![Field::new("a", DataType::Integer)];
        assert!(DataFrame::new(fields.clone(), vec![vec![json!(1)]]).is_ok());
        assert!(DataFrame::new(fields, vec![vec![json!(1), json!(2)]]).is_err());
    }

    #[test]
    fn predicate_reports_nulls() {
        let df = prices();
        let mask = df.predicate(&parse_expr("open > 0").unwrap()).unwrap();
        assert_eq!(mask, vec![Some(true), Some(false), None]);
        assert!(df.predicate(&parse_expr("open + 1").unwrap()).is_err());
        assert_eq!(df.filter(&parse_expr("open > 0").unwrap()).unwrap().num_rows(), 1);
    }

    #[test]
    fn with_column_appends_and_replaces() {
        let df = prices();
        let df = df
            .with_column("spread", &parse_expr("close - open").unwrap(), None)
            .unwrap();
        assert_eq!(df.columns(), vec!["symbol", "open", "close", "spread"]);
        assert_eq!(df.to_records()[0]["spread"], json!(1.0));
        let df = df
            .with_column("open", &parse_expr("open").unwrap(), Some(DataType::String))
            .unwrap();
        assert_eq!(df.to_records()[0]["open"], json!("5"));
        assert_eq!(df.schema()[1].dtype, DataType::String);
    }

    #[test]
    fn query_filters_then_projects() {
        let df = prices();
        let q = parse_query("SELECT symbol, close * 2 AS double_close FROM {df} WHERE open > 0")
            .unwrap();
        let out = df.query(&q).unwrap();
        assert_eq!(out.to_records(), vec![json!({"symbol": "AAPL", "double_close": 12.0})]);
    }

    #[test]
    fn select_nested_path() {
        let df = DataFrame::from_records(vec![json!({"data": {"symbol": "AAPL"}})]).unwrap();
        let out = df.select(&["data.symbol"]).unwrap();
        assert_eq!(out.to_records(), vec![json!({"symbol": "AAPL"})]);
        assert!(df.select(&["missing"]).is_err());
    }

    #[test]
    fn union_aligns_by_name() {
        let a = DataFrame::from_records(vec![json!({"x": 1, "y": "a"})]).unwrap();
        let b = DataFrame::from_records(vec![json!({"y": "b", "z": true})]).unwrap();
        let u = a.union_by_name(&b);
        assert_eq!(u.columns(), vec!["x", "y", "z"]);
        assert_eq!(
            u.to_records(),
            vec![
                json!({"x": 1, "y": "a", "z": null}),
                json!({"x": null, "y": "b", "z": true}),
            ]
        );
    }

    #[test]
    fn sort_and_distinct() {
        let df = prices();
        let sorted = df
            .sort(&[SortKey {
                column: "close".into(),
                descending: true,
            }])
            .unwrap();
        assert_eq!(sorted.column_values("close").unwrap(), vec![json!(7.5), json!(6.0), json!(2.0)]);
        let unique = df.distinct(Some(&["symbol".to_string()])).unwrap();
        assert_eq!(unique.num_rows(), 2);
        assert_eq!(unique.to_records()[0]["open"], json!(5));
    }

    #[test]
    fn join_coalesces_keys() {
        let left = DataFrame::from_records(vec![
            json!({"symbol": "AAPL", "open": 5}),
            json!({"symbol": "GOOG", "open": 9}),
        ])
        .unwrap();
        let right = DataFrame::from_records(vec![
            json!({"symbol": "AAPL", "name": "Apple", "open": 1}),
            json!({"symbol": "MSFT", "name": "Microsoft", "open": 2}),
        ])
        .unwrap();
        let on = vec!["symbol".to_string()];

        let inner = left.join(&right, &on, JoinHow::Inner).unwrap();
        assert_eq!(inner.columns(), vec!["symbol", "open", "name", "open_right"]);
        assert_eq!(inner.num_rows(), 1);

        let outer = left.join(&right, &on, JoinHow::Outer).unwrap();
        let symbols = outer.column_values("symbol").unwrap();
        assert_eq!(symbols, vec![json!("AAPL"), json!("GOOG"), json!("MSFT")]);

        let anti = left.join(&right, &on, JoinHow::Anti).unwrap();
        assert_eq!(anti.to_records(), vec![json!({"symbol": "GOOG", "open": 9})]);
    }

    #[test]
    fn group_by_aggregates() {
        let df = prices();
        let aggs = vec![
            Aggregation {
                column: None,
                func: AggFunc::Count,
                alias: "n".into(),
            },
            Aggregation {
                column: Some("open".into()),
                func: AggFunc::Sum,
                alias: "open_sum".into(),
            },
            Aggregation {
                column: Some("close".into()),
                func: AggFunc::Mean,
                alias: "close_mean".into(),
            },
            Aggregation {
                column: Some("close".into()),
                func: AggFunc::Max,
                alias: "close_max".into(),
            },
        ];
        let out = df.group_by(&["symbol".to_string()], &aggs).unwrap();
        assert_eq!(
            out.to_records(),
            vec![
                json!({"symbol": "AAPL", "n": 2, "open_sum": 5, "close_mean": 6.75, "close_max": 7.5}),
                json!({"symbol": "MSFT", "n": 1, "open_sum": -1, "close_mean": 2.0, "close_max": 2.0}),
            ]
        );
    }

    #[test]
    fn group_by_without_keys_on_empty_frame() {
        let df = DataFrame::empty(vec![Field::new("x", DataType::Integer)]);
        let out = df
            .group_by(
                &[],
                &[Aggregation {
                    column: None,
                    func: AggFunc::Count,
                    alias: "n".into(),
                }],
            )
            .unwrap();
        assert_eq!(out.to_records(), vec![json!({"n": 0})]);
    }
}
