//! DocValues for columnar storage
//!
//! Field-major typed columns, one value per document:
//! - numeric (long/date): min-offset vbyte coding, nulls bitmap
//! - double: raw IEEE bits, nulls bitmap
//! - keyword: dictionary encode to sorted ordinals + bitpacked ordinals
//! - geo: raw lat/lon pairs, nulls bitmap
//!
//! Multi-valued fields keep their first value.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;

use roaring::RoaringBitmap;

use super::postings::{bitpack_decode, bitpack_encode, decode_vbyte, encode_vbyte};
use super::types::DocNo;
use crate::models::{FieldValue, GeoPoint};

/// Column types for doc values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Long = 0,
    Date = 1,
    Double = 2,
    Keyword = 3,
    Geo = 4,
}

impl ColumnType {
    fn from_u8(tag: u8) -> io::Result<Self> {
        match tag {
            0 => Ok(ColumnType::Long),
            1 => Ok(ColumnType::Date),
            2 => Ok(ColumnType::Double),
            3 => Ok(ColumnType::Keyword),
            4 => Ok(ColumnType::Geo),
            other => Err(invalid(format!("unknown column type {}", other))),
        }
    }

    /// Column kind that holds this value, if any
    pub fn for_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Long(_) => Some(ColumnType::Long),
            FieldValue::Date(_) => Some(ColumnType::Date),
            FieldValue::Double(_) => Some(ColumnType::Double),
            FieldValue::Keyword(_) => Some(ColumnType::Keyword),
            FieldValue::GeoPoint(_) => Some(ColumnType::Geo),
            FieldValue::Text(_) => None,
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> io::Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "column data truncated"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn read_u64(data: &[u8], pos: &mut usize) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(take(data, pos, 8)?);
    Ok(u64::from_le_bytes(bytes))
}

/// Variable-byte encoding for 64-bit values
pub fn encode_vbyte64(value: u64, output: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            output.push(byte | 0x80);
            break;
        }
        output.push(byte);
    }
}

pub fn decode_vbyte64(input: &[u8], pos: &mut usize) -> io::Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *input
            .get(*pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "vbyte64 truncated"))?;
        *pos += 1;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 != 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(invalid("vbyte64 value too large"));
        }
    }
}

fn write_bitmap(bitmap: &RoaringBitmap, output: &mut Vec<u8>) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut bytes)?;
    encode_vbyte(bytes.len() as u32, output);
    output.extend(bytes);
    Ok(())
}

fn read_bitmap(data: &[u8], pos: &mut usize) -> io::Result<RoaringBitmap> {
    let len = decode_vbyte(data, pos)? as usize;
    RoaringBitmap::deserialize_from(take(data, pos, len)?)
}

/// Numeric column for long and date values
#[derive(Clone, Debug, Default)]
pub struct NumericColumn {
    values: Vec<Option<i64>>,
    nulls: RoaringBitmap,
    min_value: Option<i64>,
    max_value: Option<i64>,
}

impl NumericColumn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value for the next docno
    pub fn add(&mut self, value: Option<i64>) {
        let docno = self.values.len() as u32;
        match value {
            Some(v) => {
                self.min_value = Some(self.min_value.map_or(v, |m| m.min(v)));
                self.max_value = Some(self.max_value.map_or(v, |m| m.max(v)));
            }
            None => {
                self.nulls.insert(docno);
            }
        }
        self.values.push(value);
    }

    pub fn get(&self, docno: DocNo) -> Option<i64> {
        self.values.get(docno.as_usize()).copied().flatten()
    }

    pub fn is_null(&self, docno: DocNo) -> bool {
        self.nulls.contains(docno.as_u32())
    }

    pub fn min_value(&self) -> Option<i64> {
        self.min_value
    }

    pub fn max_value(&self) -> Option<i64> {
        self.max_value
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        encode_vbyte(self.values.len() as u32, &mut output);
        write_bitmap(&self.nulls, &mut output)?;

        match self.min_value {
            Some(min) => {
                output.push(1);
                output.extend_from_slice(&min.to_le_bytes());
                for v in self.values.iter().flatten() {
                    // Offsets from the minimum are non-negative and fit in u64
                    encode_vbyte64(v.wrapping_sub(min) as u64, &mut output);
                }
            }
            None => output.push(0),
        }
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;
        let nulls = read_bitmap(data, &mut pos)?;
        let has_values = take(data, &mut pos, 1)?[0] == 1;

        let mut column = NumericColumn::new();
        if has_values {
            let min = read_u64(data, &mut pos)? as i64;
            for docno in 0..count {
                if nulls.contains(docno as u32) {
                    column.add(None);
                } else {
                    let offset = decode_vbyte64(data, &mut pos)?;
                    column.add(Some(min.wrapping_add(offset as i64)));
                }
            }
        } else {
            for _ in 0..count {
                column.add(None);
            }
        }
        Ok(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Double column stored as raw bits
#[derive(Clone, Debug, Default)]
pub struct DoubleColumn {
    values: Vec<Option<f64>>,
    nulls: RoaringBitmap,
}

impl DoubleColumn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Option<f64>) {
        if value.is_none() {
            self.nulls.insert(self.values.len() as u32);
        }
        self.values.push(value);
    }

    pub fn get(&self, docno: DocNo) -> Option<f64> {
        self.values.get(docno.as_usize()).copied().flatten()
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        encode_vbyte(self.values.len() as u32, &mut output);
        write_bitmap(&self.nulls, &mut output)?;
        for v in self.values.iter().flatten() {
            output.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;
        let nulls = read_bitmap(data, &mut pos)?;
        let mut column = DoubleColumn::new();
        for docno in 0..count {
            if nulls.contains(docno as u32) {
                column.add(None);
            } else {
                column.add(Some(f64::from_bits(read_u64(data, &mut pos)?)));
            }
        }
        Ok(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Keyword column with dictionary encoding.
///
/// Ordinals follow the sorted dictionary, so comparing ordinals compares keywords.
#[derive(Clone, Debug, Default)]
pub struct KeywordColumn {
    dictionary: Vec<String>,
    ordinals: Vec<Option<u32>>,
}

impl KeywordColumn {
    /// Build from per-document values
    pub fn from_values(values: &[Option<String>]) -> Self {
        let unique: BTreeSet<&str> = values.iter().flatten().map(|s| s.as_str()).collect();
        let dictionary: Vec<String> = unique.into_iter().map(str::to_string).collect();
        let lookup: HashMap<&str, u32> = dictionary
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i as u32))
            .collect();
        let ordinals = values
            .iter()
            .map(|v| v.as_deref().and_then(|s| lookup.get(s).copied()))
            .collect();
        Self {
            dictionary,
            ordinals,
        }
    }

    pub fn get(&self, docno: DocNo) -> Option<&str> {
        self.ordinal(docno)
            .and_then(|ord| self.dictionary.get(ord as usize))
            .map(|s| s.as_str())
    }

    pub fn ordinal(&self, docno: DocNo) -> Option<u32> {
        self.ordinals.get(docno.as_usize()).copied().flatten()
    }

    /// All unique keywords in sorted order
    pub fn unique_keywords(&self) -> &[String] {
        &self.dictionary
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();

        encode_vbyte(self.dictionary.len() as u32, &mut output);
        for keyword in &self.dictionary {
            encode_vbyte(keyword.len() as u32, &mut output);
            output.extend(keyword.as_bytes());
        }

        encode_vbyte(self.ordinals.len() as u32, &mut output);
        // 0 marks a missing value, real ordinals are shifted by one
        let encoded: Vec<u32> = self
            .ordinals
            .iter()
            .map(|ord| ord.map(|o| o + 1).unwrap_or(0))
            .collect();
        bitpack_encode(&encoded, &mut output);
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;

        let dict_len = decode_vbyte(data, &mut pos)? as usize;
        let mut dictionary = Vec::with_capacity(dict_len.min(data.len()));
        for _ in 0..dict_len {
            let len = decode_vbyte(data, &mut pos)? as usize;
            let keyword = std::str::from_utf8(take(data, &mut pos, len)?)
                .map_err(|e| invalid(e.to_string()))?
                .to_string();
            dictionary.push(keyword);
        }

        let doc_count = decode_vbyte(data, &mut pos)? as usize;
        let encoded = bitpack_decode(data, &mut pos, doc_count)?;
        let mut ordinals = Vec::with_capacity(doc_count);
        for v in encoded {
            if v as usize > dictionary.len() {
                return Err(invalid("keyword ordinal out of range"));
            }
            ordinals.push(v.checked_sub(1));
        }

        Ok(Self {
            dictionary,
            ordinals,
        })
    }

    pub fn len(&self) -> usize {
        self.ordinals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordinals.is_empty()
    }
}

/// Geo point column
#[derive(Clone, Debug, Default)]
pub struct GeoColumn {
    values: Vec<Option<GeoPoint>>,
    nulls: RoaringBitmap,
}

impl GeoColumn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Option<GeoPoint>) {
        if value.is_none() {
            self.nulls.insert(self.values.len() as u32);
        }
        self.values.push(value);
    }

    pub fn get(&self, docno: DocNo) -> Option<GeoPoint> {
        self.values.get(docno.as_usize()).copied().flatten()
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        encode_vbyte(self.values.len() as u32, &mut output);
        write_bitmap(&self.nulls, &mut output)?;
        for p in self.values.iter().flatten() {
            output.extend_from_slice(&p.lat.to_bits().to_le_bytes());
            output.extend_from_slice(&p.lon.to_bits().to_le_bytes());
        }
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;
        let nulls = read_bitmap(data, &mut pos)?;
        let mut column = GeoColumn::new();
        for docno in 0..count {
            if nulls.contains(docno as u32) {
                column.add(None);
            } else {
                let lat = f64::from_bits(read_u64(data, &mut pos)?);
                let lon = f64::from_bits(read_u64(data, &mut pos)?);
                column.add(Some(GeoPoint::new(lat, lon)));
            }
        }
        Ok(column)
    }
}

/// One typed column
#[derive(Clone, Debug)]
pub enum Column {
    Long(NumericColumn),
    Date(NumericColumn),
    Double(DoubleColumn),
    Keyword(KeywordColumn),
    Geo(GeoColumn),
}

impl Column {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Column::Long(_) => ColumnType::Long,
            Column::Date(_) => ColumnType::Date,
            Column::Double(_) => ColumnType::Double,
            Column::Keyword(_) => ColumnType::Keyword,
            Column::Geo(_) => ColumnType::Geo,
        }
    }

    pub fn get(&self, docno: DocNo) -> Option<FieldValue> {
        match self {
            Column::Long(c) => c.get(docno).map(FieldValue::Long),
            Column::Date(c) => c.get(docno).map(FieldValue::Date),
            Column::Double(c) => c.get(docno).map(FieldValue::Double),
            Column::Keyword(c) => c.get(docno).map(|s| FieldValue::Keyword(s.to_string())),
            Column::Geo(c) => c.get(docno).map(FieldValue::GeoPoint),
        }
    }

    fn serialize(&self) -> io::Result<Vec<u8>> {
        match self {
            Column::Long(c) | Column::Date(c) => c.serialize(),
            Column::Double(c) => c.serialize(),
            Column::Keyword(c) => c.serialize(),
            Column::Geo(c) => c.serialize(),
        }
    }

    fn deserialize(column_type: ColumnType, data: &[u8]) -> io::Result<Self> {
        Ok(match column_type {
            ColumnType::Long => Column::Long(NumericColumn::deserialize(data)?),
            ColumnType::Date => Column::Date(NumericColumn::deserialize(data)?),
            ColumnType::Double => Column::Double(DoubleColumn::deserialize(data)?),
            ColumnType::Keyword => Column::Keyword(KeywordColumn::deserialize(data)?),
            ColumnType::Geo => Column::Geo(GeoColumn::deserialize(data)?),
        })
    }
}

/// Accumulates first values per field, then freezes them into columns
#[derive(Debug, Default)]
pub struct ColumnStoreBuilder {
    fields: BTreeMap<String, (ColumnType, Vec<Option<FieldValue>>)>,
    doc_count: usize,
}

impl ColumnStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value of `field` for `docno`. Docnos must be added in ascending order;
    /// later values for the same (field, docno) are ignored. Values of a different kind
    /// than the column's first value are ignored.
    pub fn add(&mut self, field: &str, docno: DocNo, value: &FieldValue) {
        let Some(kind) = ColumnType::for_value(value) else {
            return;
        };
        let (column_type, values) = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| (kind, Vec::new()));
        if *column_type != kind {
            return;
        }
        let idx = docno.as_usize();
        if values.len() > idx {
            return;
        }
        values.resize(idx, None);
        values.push(Some(value.clone()));
        self.doc_count = self.doc_count.max(idx + 1);
    }

    /// Freeze into a column store covering `doc_count` documents
    pub fn build(self, doc_count: usize) -> ColumnStore {
        let mut columns = BTreeMap::new();
        for (field, (column_type, mut values)) in self.fields {
            values.resize(doc_count.max(values.len()), None);
            let column = match column_type {
                ColumnType::Long | ColumnType::Date => {
                    let mut c = NumericColumn::new();
                    for v in &values {
                        c.add(match v {
                            Some(FieldValue::Long(x)) | Some(FieldValue::Date(x)) => Some(*x),
                            _ => None,
                        });
                    }
                    if column_type == ColumnType::Long {
                        Column::Long(c)
                    } else {
                        Column::Date(c)
                    }
                }
                ColumnType::Double => {
                    let mut c = DoubleColumn::new();
                    for v in &values {
                        c.add(match v {
                            Some(FieldValue::Double(x)) => Some(*x),
                            _ => None,
                        });
                    }
                    Column::Double(c)
                }
                ColumnType::Keyword => {
                    let strings: Vec<Option<String>> = values
                        .iter()
                        .map(|v| match v {
                            Some(FieldValue::Keyword(s)) => Some(s.clone()),
                            _ => None,
                        })
                        .collect();
                    Column::Keyword(KeywordColumn::from_values(&strings))
                }
                ColumnType::Geo => {
                    let mut c = GeoColumn::new();
                    for v in &values {
                        c.add(match v {
                            Some(FieldValue::GeoPoint(p)) => Some(*p),
                            _ => None,
                        });
                    }
                    Column::Geo(c)
                }
            };
            columns.insert(field, column);
        }
        ColumnStore { columns }
    }
}

/// All columns of a segment
#[derive(Clone, Debug, Default)]
pub struct ColumnStore {
    columns: BTreeMap<String, Column>,
}

impl ColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `field` for `docno`, if the document has one
    pub fn values_for(&self, field: &str, docno: DocNo) -> Option<FieldValue> {
        self.columns.get(field).and_then(|c| c.get(docno))
    }

    pub fn column(&self, field: &str) -> Option<&Column> {
        self.columns.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Serialize all columns into a single byte stream.
    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        encode_vbyte(self.columns.len() as u32, &mut output);
        for (name, column) in &self.columns {
            output.push(column.column_type() as u8);
            encode_vbyte(name.len() as u32, &mut output);
            output.extend(name.as_bytes());
            let data = column.serialize()?;
            output.extend_from_slice(&(data.len() as u64).to_le_bytes());
            output.extend(data);
        }
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;
        let mut columns = BTreeMap::new();
        for _ in 0..count {
            let column_type = ColumnType::from_u8(take(data, &mut pos, 1)?[0])?;
            let name_len = decode_vbyte(data, &mut pos)? as usize;
            let name = std::str::from_utf8(take(data, &mut pos, name_len)?)
                .map_err(|e| invalid(e.to_string()))?
                .to_string();
            let len = read_u64(data, &mut pos)? as usize;
            let column = Column::deserialize(column_type, take(data, &mut pos, len)?)?;
            columns.insert(name, column);
        }
        Ok(Self { columns })
    }
}
