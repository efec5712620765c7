//! Block KD-tree over numeric and geo points
//!
//! Each numeric field (long, double, date) gets a 1-D tree and each geo field a
//! 2-D tree. Points are partitioned in place so that every node covers a
//! contiguous run of the point array; leaves hold at most [`LEAF_SIZE`] points.
//! Range queries walk the tree lazily, skip nodes whose bounding box misses the
//! query box and emit nodes fully inside it without looking at single points.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::DocNo;
use crate::models::{FieldValue, GeoPoint};

/// Maximum number of points in a leaf
pub const LEAF_SIZE: usize = 512;

/// Geo coordinates are stored as degrees * 1e7
const GEO_SCALE: f64 = 1e7;

/// How field values map onto tree coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointEncoding {
    /// long and date values, stored as is
    Integer,
    /// doubles mapped to order-preserving integers
    Double,
    /// (lat, lon) scaled to fixed point
    Geo,
}

impl PointEncoding {
    pub fn dims(&self) -> usize {
        match self {
            PointEncoding::Geo => 2,
            _ => 1,
        }
    }

    fn for_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Long(_) | FieldValue::Date(_) => Some(PointEncoding::Integer),
            FieldValue::Double(_) => Some(PointEncoding::Double),
            FieldValue::GeoPoint(_) => Some(PointEncoding::Geo),
            _ => None,
        }
    }

    fn encode(&self, value: &FieldValue) -> Option<[i64; 2]> {
        match (self, value) {
            (PointEncoding::Integer, FieldValue::Long(v) | FieldValue::Date(v)) => Some([*v, 0]),
            (PointEncoding::Double, FieldValue::Double(v)) => Some([encode_double(*v), 0]),
            (PointEncoding::Geo, FieldValue::GeoPoint(p)) => Some(encode_geo(p)),
            _ => None,
        }
    }
}

/// Map an f64 to an i64 with the same ordering
pub fn encode_double(value: f64) -> i64 {
    let bits = value.to_bits() as i64;
    bits ^ (((bits >> 63) as u64) >> 1) as i64
}

pub fn encode_geo(point: &GeoPoint) -> [i64; 2] {
    [
        (point.lat * GEO_SCALE).round() as i64,
        (point.lon * GEO_SCALE).round() as i64,
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct IndexedPoint {
    coords: [i64; 2],
    docno: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Node {
    Inner {
        min: [i64; 2],
        max: [i64; 2],
        start: usize,
        end: usize,
        left: usize,
        right: usize,
    },
    Leaf {
        min: [i64; 2],
        max: [i64; 2],
        start: usize,
        end: usize,
    },
}

impl Node {
    fn bounds(&self) -> ([i64; 2], [i64; 2]) {
        match self {
            Node::Inner { min, max, .. } | Node::Leaf { min, max, .. } => (*min, *max),
        }
    }

    fn span(&self) -> (usize, usize) {
        match self {
            Node::Inner { start, end, .. } | Node::Leaf { start, end, .. } => (*start, *end),
        }
    }
}

/// A block KD-tree for one field
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockTree {
    encoding: PointEncoding,
    nodes: Vec<Node>,
    points: Vec<IndexedPoint>,
}

impl BlockTree {
    fn build(encoding: PointEncoding, mut points: Vec<IndexedPoint>) -> Self {
        let mut nodes = Vec::new();
        if !points.is_empty() {
            let len = points.len();
            build_node(&mut points, 0, len, encoding.dims(), &mut nodes);
        }
        Self {
            encoding,
            nodes,
            points,
        }
    }

    pub fn encoding(&self) -> PointEncoding {
        self.encoding
    }

    /// Every indexed point with its docno, in tree order
    pub fn points(&self) -> impl Iterator<Item = ([i64; 2], DocNo)> + '_ {
        self.points.iter().map(|p| (p.coords, DocNo(p.docno)))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Lazy iterator over blocks of docnos whose point lies in the inclusive box `[lo, hi]`.
    ///
    /// A document with several points can appear more than once.
    pub fn range_query(&self, lo: [i64; 2], hi: [i64; 2]) -> RangeQueryIter<'_> {
        let dims = self.encoding.dims();
        let empty_box = (0..dims).any(|d| lo[d] > hi[d]);
        RangeQueryIter {
            tree: self,
            lo,
            hi,
            dims,
            stack: if self.nodes.is_empty() || empty_box {
                Vec::new()
            } else {
                vec![0]
            },
        }
    }

    /// Numeric range with optional inclusive bounds in the field's natural units
    pub fn numeric_range(&self, gte: Option<f64>, lte: Option<f64>) -> RangeQueryIter<'_> {
        let (lo, hi) = match self.encoding {
            PointEncoding::Integer => (
                gte.map_or(i64::MIN, |v| v.ceil().clamp(i64::MIN as f64, i64::MAX as f64) as i64),
                lte.map_or(i64::MAX, |v| v.floor().clamp(i64::MIN as f64, i64::MAX as f64) as i64),
            ),
            PointEncoding::Double => (
                gte.map_or(i64::MIN, encode_double),
                lte.map_or(i64::MAX, encode_double),
            ),
            // A numeric range never matches a geo field
            PointEncoding::Geo => (1, 0),
        };
        self.range_query([lo, i64::MIN], [hi, i64::MAX])
    }

    /// Points inside the box spanned by two corners
    pub fn geo_box(&self, a: &GeoPoint, b: &GeoPoint) -> RangeQueryIter<'_> {
        if self.encoding != PointEncoding::Geo {
            return self.range_query([1, 1], [0, 0]);
        }
        let (ea, eb) = (encode_geo(a), encode_geo(b));
        self.range_query(
            [ea[0].min(eb[0]), ea[1].min(eb[1])],
            [ea[0].max(eb[0]), ea[1].max(eb[1])],
        )
    }
}

fn bounding_box(points: &[IndexedPoint]) -> ([i64; 2], [i64; 2]) {
    let mut min = [i64::MAX; 2];
    let mut max = [i64::MIN; 2];
    for p in points {
        for d in 0..2 {
            min[d] = min[d].min(p.coords[d]);
            max[d] = max[d].max(p.coords[d]);
        }
    }
    (min, max)
}

fn build_node(
    points: &mut [IndexedPoint],
    start: usize,
    end: usize,
    dims: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    let (min, max) = bounding_box(&points[start..end]);
    let idx = nodes.len();

    if end - start <= LEAF_SIZE {
        nodes.push(Node::Leaf {
            min,
            max,
            start,
            end,
        });
        return idx;
    }

    // Split on the dimension with the widest spread
    let split_dim = (0..dims)
        .max_by_key(|&d| (max[d] as i128) - (min[d] as i128))
        .unwrap_or(0);
    let mid = start + (end - start) / 2;
    points[start..end].select_nth_unstable_by_key(mid - start, |p| p.coords[split_dim]);

    // Placeholder, patched once children exist
    nodes.push(Node::Leaf {
        min,
        max,
        start,
        end,
    });
    let left = build_node(points, start, mid, dims, nodes);
    let right = build_node(points, mid, end, dims, nodes);
    nodes[idx] = Node::Inner {
        min,
        max,
        start,
        end,
        left,
        right,
    };
    idx
}

/// Lazy range query over a [`BlockTree`]
pub struct RangeQueryIter<'a> {
    tree: &'a BlockTree,
    lo: [i64; 2],
    hi: [i64; 2],
    dims: usize,
    stack: Vec<usize>,
}

impl<'a> RangeQueryIter<'a> {
    fn disjoint(&self, min: &[i64; 2], max: &[i64; 2]) -> bool {
        (0..self.dims).any(|d| max[d] < self.lo[d] || min[d] > self.hi[d])
    }

    fn contains_box(&self, min: &[i64; 2], max: &[i64; 2]) -> bool {
        (0..self.dims).all(|d| min[d] >= self.lo[d] && max[d] <= self.hi[d])
    }

    fn contains_point(&self, p: &[i64; 2]) -> bool {
        (0..self.dims).all(|d| p[d] >= self.lo[d] && p[d] <= self.hi[d])
    }
}

impl<'a> Iterator for RangeQueryIter<'a> {
    type Item = Vec<DocNo>;

    fn next(&mut self) -> Option<Vec<DocNo>> {
        let tree = self.tree;
        while let Some(idx) = self.stack.pop() {
            let node = &tree.nodes[idx];
            let (min, max) = node.bounds();
            if self.disjoint(&min, &max) {
                continue;
            }

            let (start, end) = node.span();
            let points = &tree.points[start..end];
            if self.contains_box(&min, &max) {
                return Some(points.iter().map(|p| DocNo(p.docno)).collect());
            }

            match node {
                Node::Inner { left, right, .. } => {
                    self.stack.push(*right);
                    self.stack.push(*left);
                }
                Node::Leaf { .. } => {
                    let block: Vec<DocNo> = points
                        .iter()
                        .filter(|p| self.contains_point(&p.coords))
                        .map(|p| DocNo(p.docno))
                        .collect();
                    if !block.is_empty() {
                        return Some(block);
                    }
                }
            }
        }
        None
    }
}

/// Collects points per field while a segment is built
#[derive(Debug, Default)]
pub struct RangeIndexBuilder {
    fields: BTreeMap<String, (PointEncoding, Vec<IndexedPoint>)>,
}

impl RangeIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one value. Values that are not numeric or geo, or whose kind differs
    /// from the field's first value, are ignored.
    pub fn add(&mut self, field: &str, docno: DocNo, value: &FieldValue) {
        let Some(encoding) = PointEncoding::for_value(value) else {
            return;
        };
        let (field_encoding, points) = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| (encoding, Vec::new()));
        if let Some(coords) = field_encoding.encode(value) {
            points.push(IndexedPoint {
                coords,
                docno: docno.0,
            });
        }
    }

    /// Add an already encoded point; ignored if the field uses another encoding
    pub fn add_point(
        &mut self,
        field: &str,
        encoding: PointEncoding,
        coords: [i64; 2],
        docno: DocNo,
    ) {
        let (field_encoding, points) = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| (encoding, Vec::new()));
        if *field_encoding == encoding {
            points.push(IndexedPoint {
                coords,
                docno: docno.0,
            });
        }
    }

    pub fn build(self) -> RangeIndex {
        let trees = self
            .fields
            .into_iter()
            .map(|(field, (encoding, points))| (field, BlockTree::build(encoding, points)))
            .collect();
        RangeIndex { trees }
    }
}

/// Block trees of every numeric and geo field of a segment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RangeIndex {
    trees: BTreeMap<String, BlockTree>,
}

impl RangeIndex {
    pub fn tree(&self, field: &str) -> Option<&BlockTree> {
        self.trees.get(field)
    }

    /// Raw box query on a field; `None` if the field has no tree in this segment
    pub fn range_query(
        &self,
        field: &str,
        lo: [i64; 2],
        hi: [i64; 2],
    ) -> Option<RangeQueryIter<'_>> {
        self.trees.get(field).map(|t| t.range_query(lo, hi))
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.trees.keys().map(|k| k.as_str())
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}
