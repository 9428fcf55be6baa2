//! Discrete architectures derived from the continuous weights
//!
//! A [`Genotype`] keeps two incoming edges per intermediate node and one
//! primitive per kept edge. Its text form is the `Genotype(normal=[...], ...)`
//! line written to search logs, and [`FromStr`] reads that line back.

use std::fmt;
use std::str::FromStr;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use super::edges::{node_rows, num_edges};
use super::operations::Primitive;
use crate::error::{DartsError, Result};

/// Edges kept per intermediate node
pub const EDGES_PER_NODE: usize = 2;

/// A discrete cell pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genotype {
    /// `(primitive, source state)` pairs of the normal cell, two per node
    pub normal: Vec<(Primitive, usize)>,
    /// States concatenated into the normal cell output
    pub normal_concat: Vec<usize>,
    /// `(primitive, source state)` pairs of the reduction cell
    pub reduce: Vec<(Primitive, usize)>,
    /// States concatenated into the reduction cell output
    pub reduce_concat: Vec<usize>,
}

/// Output states of a cell: the last `multiplier` of its `steps + 2` states
pub fn concat_indices(steps: usize, multiplier: usize) -> Vec<usize> {
    let end = steps + 2;
    (end.saturating_sub(multiplier)..end).collect()
}

/// Collapse one softmax-normalised weight matrix into `(primitive, source)` pairs.
///
/// For each node the sources are ranked by their strongest primitive weight
/// (ties keep the lower source first) and the top two are kept. Each kept
/// edge takes its highest-weighted primitive, the first one on ties. No
/// primitive is excluded, `none` included.
pub fn parse_cell(weights: ArrayView2<f64>, steps: usize, primitives: &[Primitive]) -> Result<Vec<(Primitive, usize)>> {
    let expected = (num_edges(steps), primitives.len());
    if weights.dim() != expected {
        return Err(DartsError::shape(format!("{:?}", expected), format!("{:?}", weights.dim())));
    }

    let mut gene = Vec::with_capacity(steps * EDGES_PER_NODE);
    for node in 0..steps {
        let rows = weights.slice(ndarray::s![node_rows(node), ..]);
        let strongest: Vec<f64> = rows
            .rows()
            .into_iter()
            .map(|row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            .collect();

        let mut sources: Vec<usize> = (0..node + 2).collect();
        sources.sort_by(|&a, &b| strongest[b].total_cmp(&strongest[a]));

        for &source in sources.iter().take(EDGES_PER_NODE) {
            let row = rows.row(source);
            let mut best = 0;
            for (k, &w) in row.iter().enumerate() {
                if w > row[best] {
                    best = k;
                }
            }
            gene.push((primitives[best], source));
        }
    }
    Ok(gene)
}

impl Genotype {
    /// Number of intermediate nodes the normal cell describes
    pub fn steps(&self) -> usize {
        self.normal.len() / EDGES_PER_NODE
    }

    /// Check that every edge points at an earlier state
    pub fn validate(&self) -> Result<()> {
        for (label, gene) in [("normal", &self.normal), ("reduce", &self.reduce)] {
            if gene.len() % EDGES_PER_NODE != 0 {
                return Err(DartsError::GenotypeParse(format!(
                    "{} cell has {} edges, expected a multiple of {}",
                    label,
                    gene.len(),
                    EDGES_PER_NODE
                )));
            }
            for (k, &(op, source)) in gene.iter().enumerate() {
                let node = k / EDGES_PER_NODE;
                if source >= node + 2 {
                    return Err(DartsError::GenotypeParse(format!(
                        "{} edge {} ({}) of node {} reads unavailable state {}",
                        label, k, op, node, source
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize as JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn write_gene(f: &mut fmt::Formatter<'_>, gene: &[(Primitive, usize)]) -> fmt::Result {
    f.write_str("[")?;
    for (k, (op, source)) in gene.iter().enumerate() {
        if k > 0 {
            f.write_str(", ")?;
        }
        write!(f, "('{}', {})", op, source)?;
    }
    f.write_str("]")
}

fn write_concat(f: &mut fmt::Formatter<'_>, concat: &[usize]) -> fmt::Result {
    let contiguous = concat.windows(2).all(|w| w[1] == w[0] + 1);
    match (concat.first(), concat.last()) {
        (Some(&first), Some(&last)) if contiguous => write!(f, "range({}, {})", first, last + 1),
        _ => {
            let items: Vec<String> = concat.iter().map(usize::to_string).collect();
            write!(f, "[{}]", items.join(", "))
        }
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Genotype(normal=")?;
        write_gene(f, &self.normal)?;
        f.write_str(", normal_concat=")?;
        write_concat(f, &self.normal_concat)?;
        f.write_str(", reduce=")?;
        write_gene(f, &self.reduce)?;
        f.write_str(", reduce_concat=")?;
        write_concat(f, &self.reduce_concat)?;
        f.write_str(")")
    }
}

/// Cursor over a genotype line
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn error(&self, what: &str) -> DartsError {
        let context: String = self.rest().chars().take(24).collect();
        DartsError::GenotypeParse(format!("expected {} at byte {} near {:?}", what, self.pos, context))
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("'{}'", token)))
        }
    }

    fn ident(&mut self) -> Result<&'a str> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("identifier"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn number(&mut self) -> Result<usize> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let value = rest[..len].parse::<usize>().map_err(|_| self.error("integer"))?;
        self.pos += len;
        Ok(value)
    }

    fn quoted(&mut self) -> Result<&'a str> {
        self.skip_ws();
        let quote = match self.rest().chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("quoted primitive name")),
        };
        self.pos += 1;
        let rest = self.rest();
        let end = rest.find(quote).ok_or_else(|| self.error("closing quote"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// `[...]` of comma separated items, trailing comma allowed
    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        self.expect("[")?;
        let mut items = Vec::new();
        while !self.eat("]") {
            items.push(item(self)?);
            if !self.eat(",") {
                self.expect("]")?;
                break;
            }
        }
        Ok(items)
    }

    fn gene(&mut self) -> Result<Vec<(Primitive, usize)>> {
        self.list(|c| {
            c.expect("(")?;
            let op = Primitive::from_name(c.quoted()?)?;
            c.expect(",")?;
            let source = c.number()?;
            c.expect(")")?;
            Ok((op, source))
        })
    }

    fn concat(&mut self) -> Result<Vec<usize>> {
        if self.eat("range") {
            self.expect("(")?;
            let start = self.number()?;
            self.expect(",")?;
            let end = self.number()?;
            self.expect(")")?;
            Ok((start..end).collect())
        } else {
            self.list(Self::number)
        }
    }
}

impl FromStr for Genotype {
    type Err = DartsError;

    fn from_str(s: &str) -> Result<Self> {
        let mut c = Cursor::new(s);
        c.expect("Genotype")?;
        c.expect("(")?;

        let (mut normal, mut normal_concat, mut reduce, mut reduce_concat) = (None, None, None, None);
        while !c.eat(")") {
            let field = c.ident()?;
            c.expect("=")?;
            match field {
                "normal" => normal = Some(c.gene()?),
                "normal_concat" => normal_concat = Some(c.concat()?),
                "reduce" => reduce = Some(c.gene()?),
                "reduce_concat" => reduce_concat = Some(c.concat()?),
                other => return Err(DartsError::GenotypeParse(format!("unknown field '{}'", other))),
            }
            if !c.eat(",") {
                c.expect(")")?;
                break;
            }
        }
        c.skip_ws();
        if !c.rest().is_empty() {
            return Err(c.error("end of input"));
        }

        let missing = |name: &str| DartsError::GenotypeParse(format!("missing field '{}'", name));
        let genotype = Genotype {
            normal: normal.ok_or_else(|| missing("normal"))?,
            normal_concat: normal_concat.ok_or_else(|| missing("normal_concat"))?,
            reduce: reduce.ok_or_else(|| missing("reduce"))?,
            reduce_concat: reduce_concat.ok_or_else(|| missing("reduce_concat"))?,
        };
        genotype.validate()?;
        Ok(genotype)
    }
}
