//! Postings format with block-based compression
//!
//! Each posting list is laid out as:
//! - vbyte block count
//! - one skip entry per block: vbyte max docno, u64 block offset, u32 max tf
//! - the blocks
//!
//! A block holds up to [`BLOCK_SIZE`] documents:
//! - vbyte count
//! - bitpacked docno deltas (the base carries over from the previous block)
//! - bitpacked term frequencies
//! - per document: vbyte position count, then vbyte position deltas

use std::io;

use super::types::{DocNo, Posting, PostingBlock, PostingListMeta, BLOCK_SIZE};

/// Variable-byte encoding for integers
pub fn encode_vbyte(value: u32, output: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            output.push(byte | 0x80); // High bit marks the last byte
            break;
        } else {
            output.push(byte);
        }
    }
}

/// Decode a variable-byte encoded integer
pub fn decode_vbyte(input: &[u8], pos: &mut usize) -> io::Result<u32> {
    let mut result: u32 = 0;
    let mut shift = 0;

    loop {
        if *pos >= input.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Unexpected end of vbyte",
            ));
        }

        let byte = input[*pos];
        *pos += 1;

        result |= ((byte & 0x7F) as u32) << shift;

        if byte & 0x80 != 0 {
            return Ok(result);
        }

        shift += 7;
        if shift > 28 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "VByte value too large",
            ));
        }
    }
}

/// Simple bitpacking for a block of integers
/// Uses the minimum number of bits needed to represent the max value
pub fn bitpack_encode(values: &[u32], output: &mut Vec<u8>) {
    let max_val = values.iter().copied().max().unwrap_or(0);
    if values.is_empty() {
        output.push(0);
        return;
    }

    let bits_needed = if max_val == 0 {
        1
    } else {
        32 - max_val.leading_zeros()
    } as u8;

    output.push(bits_needed);

    let mut current: u64 = 0;
    let mut bits_in_current = 0;

    for &value in values {
        current |= (value as u64) << bits_in_current;
        bits_in_current += bits_needed as u32;

        while bits_in_current >= 8 {
            output.push(current as u8);
            current >>= 8;
            bits_in_current -= 8;
        }
    }

    if bits_in_current > 0 {
        output.push(current as u8);
    }
}

/// Decode bitpacked integers
pub fn bitpack_decode(input: &[u8], pos: &mut usize, count: usize) -> io::Result<Vec<u32>> {
    if *pos >= input.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected end of bitpack",
        ));
    }

    let bits_needed = input[*pos] as u32;
    *pos += 1;

    if bits_needed == 0 {
        return Ok(vec![0; count]);
    }
    if bits_needed > 32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Bitpack width too large",
        ));
    }

    let total_bits = count as u64 * bits_needed as u64;
    let bytes_needed = ((total_bits + 7) / 8) as usize;

    if *pos + bytes_needed > input.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Not enough bytes for bitpack",
        ));
    }

    let mut values = Vec::with_capacity(count);
    let mut current: u64 = 0;
    let mut bits_available = 0;
    let mask = (1u64 << bits_needed) - 1;
    let end = *pos + bytes_needed;

    for _ in 0..count {
        while bits_available < bits_needed {
            if *pos < end {
                current |= (input[*pos] as u64) << bits_available;
                *pos += 1;
            }
            bits_available += 8;
        }

        values.push((current & mask) as u32);
        current >>= bits_needed;
        bits_available -= bits_needed;
    }
    *pos = end;

    Ok(values)
}

/// Skip data for fast block skipping during query processing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkipEntry {
    /// Maximum docno in this block
    pub max_docno: DocNo,
    /// Offset of this block from the start of the block area
    pub block_offset: u64,
    /// Maximum term frequency in this block
    pub max_tf: u32,
}

/// Writer for posting lists
pub struct PostingsWriter {
    block_data: Vec<u8>,
    skip_entries: Vec<SkipEntry>,
    current_block: PostingBlock,
    /// Last docno written to the current list; the delta base of the next block
    last_docno: Option<DocNo>,
    data: Vec<u8>,
}

impl PostingsWriter {
    pub fn new() -> Self {
        Self {
            block_data: Vec::new(),
            skip_entries: Vec::new(),
            current_block: PostingBlock::new(),
            last_docno: None,
            data: Vec::new(),
        }
    }

    /// Start writing a new posting list
    pub fn start_posting_list(&mut self) {
        self.block_data.clear();
        self.skip_entries.clear();
        self.current_block = PostingBlock::new();
        self.last_docno = None;
    }

    /// Add a posting to the current list. Docnos must be strictly increasing.
    pub fn add_posting(&mut self, posting: Posting) -> io::Result<()> {
        let last_in_block = self.current_block.docnos.last().copied();
        if let Some(last) = last_in_block.or(self.last_docno) {
            if posting.docno <= last {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "postings out of order: {} after {}",
                        posting.docno.0, last.0
                    ),
                ));
            }
        }

        self.current_block.push(posting);

        if self.current_block.is_full() {
            self.flush_block();
        }
        Ok(())
    }

    /// Finish writing a posting list and return metadata
    pub fn finish_posting_list(
        &mut self,
        doc_frequency: u32,
        total_term_frequency: u64,
    ) -> PostingListMeta {
        if !self.current_block.is_empty() {
            self.flush_block();
        }

        let offset = self.data.len() as u64;

        encode_vbyte(self.skip_entries.len() as u32, &mut self.data);
        for skip in &self.skip_entries {
            encode_vbyte(skip.max_docno.0, &mut self.data);
            self.data.extend_from_slice(&skip.block_offset.to_le_bytes());
            self.data.extend_from_slice(&skip.max_tf.to_le_bytes());
        }
        self.data.extend_from_slice(&self.block_data);

        let length = self.data.len() as u64 - offset;

        PostingListMeta {
            offset,
            length,
            doc_frequency,
            total_term_frequency,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the data (consuming the writer)
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn flush_block(&mut self) {
        if self.current_block.is_empty() {
            return;
        }

        let block = std::mem::take(&mut self.current_block);
        let block_start = self.block_data.len() as u64;

        self.skip_entries.push(SkipEntry {
            max_docno: block.max_docno,
            block_offset: block_start,
            max_tf: block.max_tf,
        });

        encode_vbyte(block.len() as u32, &mut self.block_data);

        // The first delta of a list is the docno itself
        let mut prev = self.last_docno.map(|d| d.0);
        let mut deltas = Vec::with_capacity(block.len());
        for docno in &block.docnos {
            deltas.push(match prev {
                Some(p) => docno.0 - p,
                None => docno.0,
            });
            prev = Some(docno.0);
        }
        bitpack_encode(&deltas, &mut self.block_data);
        bitpack_encode(&block.term_frequencies, &mut self.block_data);

        for positions in &block.positions {
            encode_vbyte(positions.len() as u32, &mut self.block_data);
            let mut last = 0u32;
            for &p in positions {
                encode_vbyte(p - last, &mut self.block_data);
                last = p;
            }
        }

        self.last_docno = block.docnos.last().copied();
        self.current_block = PostingBlock::new();
    }
}

impl Default for PostingsWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader for posting lists
pub struct PostingsReader {
    data: Vec<u8>,
}

impl PostingsReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Get an iterator over postings for a term
    pub fn get_postings(&self, meta: &PostingListMeta) -> io::Result<PostingIterator<'_>> {
        let start = meta.offset as usize;
        let end = (meta.offset + meta.length) as usize;

        if end > self.data.len() || start > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Posting list extends beyond data",
            ));
        }

        PostingIterator::new(&self.data[start..end])
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A forward-only cursor over ascending docnos
pub trait DocCursor {
    /// Current docno, `None` before the first advance or once exhausted
    fn doc(&self) -> Option<DocNo>;

    /// Advance to the next docno
    fn next_doc(&mut self) -> Option<DocNo>;

    /// Advance to the first docno `>= target`. Never moves backwards: if the
    /// cursor already sits at or past `target` it stays put.
    fn seek(&mut self, target: DocNo) -> Option<DocNo>;
}

/// Iterator over postings in a posting list
pub struct PostingIterator<'a> {
    data: &'a [u8],
    /// Position in data where blocks start (after skip entries)
    blocks_start: usize,
    skip_entries: Vec<SkipEntry>,
    /// Index of the next block to decode
    next_block: usize,
    block_docs: Vec<DocNo>,
    block_tfs: Vec<u32>,
    block_positions: Vec<Vec<u32>>,
    /// Position of the current posting within the decoded block
    block_pos: usize,
    current: Option<DocNo>,
    exhausted: bool,
}

impl<'a> PostingIterator<'a> {
    pub fn new(data: &'a [u8]) -> io::Result<Self> {
        let mut pos = 0;
        let block_count = decode_vbyte(data, &mut pos)? as usize;

        let mut skip_entries = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let max_docno = decode_vbyte(data, &mut pos)?;
            if pos + 12 > data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Truncated skip entry",
                ));
            }
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&data[pos..pos + 8]);
            let mut max_tf = [0u8; 4];
            max_tf.copy_from_slice(&data[pos + 8..pos + 12]);
            pos += 12;

            skip_entries.push(SkipEntry {
                max_docno: DocNo(max_docno),
                block_offset: u64::from_le_bytes(offset),
                max_tf: u32::from_le_bytes(max_tf),
            });
        }

        Ok(Self {
            data,
            blocks_start: pos,
            skip_entries,
            next_block: 0,
            block_docs: Vec::new(),
            block_tfs: Vec::new(),
            block_positions: Vec::new(),
            block_pos: 0,
            current: None,
            exhausted: block_count == 0,
        })
    }

    /// Term frequency at the current document
    pub fn term_frequency(&self) -> u32 {
        match self.current {
            Some(_) => self.block_tfs.get(self.block_pos).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// Positions at the current document
    pub fn positions(&self) -> &[u32] {
        match self.current {
            Some(_) => self
                .block_positions
                .get(self.block_pos)
                .map(|p| p.as_slice())
                .unwrap_or(&[]),
            None => &[],
        }
    }

    /// Skip entries of this list
    pub fn skip_entries(&self) -> &[SkipEntry] {
        &self.skip_entries
    }

    /// Upper bound of the term frequency in blocks not yet passed
    pub fn max_remaining_tf(&self) -> u32 {
        let from = self.next_block.saturating_sub(1);
        self.skip_entries[from.min(self.skip_entries.len())..]
            .iter()
            .map(|s| s.max_tf)
            .max()
            .unwrap_or(0)
    }

    /// Skip to the first posting with docno >= target
    pub fn skip_to(&mut self, target: DocNo) -> Option<(DocNo, u32)> {
        self.seek(target).map(|doc| (doc, self.term_frequency()))
    }

    fn finish(&mut self) -> Option<DocNo> {
        self.exhausted = true;
        self.current = None;
        None
    }

    fn load_block(&mut self, idx: usize) -> io::Result<()> {
        let mut pos = self.blocks_start + self.skip_entries[idx].block_offset as usize;
        let count = decode_vbyte(self.data, &mut pos)? as usize;
        if count == 0 || count > BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid posting block size",
            ));
        }

        let deltas = bitpack_decode(self.data, &mut pos, count)?;
        let tfs = bitpack_decode(self.data, &mut pos, count)?;

        let mut docs = Vec::with_capacity(count);
        let mut prev = if idx > 0 {
            Some(self.skip_entries[idx - 1].max_docno.0)
        } else {
            None
        };
        for delta in deltas {
            let docno = match prev {
                Some(p) => p.checked_add(delta).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "Docno overflow")
                })?,
                None => delta,
            };
            docs.push(DocNo(docno));
            prev = Some(docno);
        }

        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            let n = decode_vbyte(self.data, &mut pos)? as usize;
            let mut list = Vec::with_capacity(n.min(1024));
            let mut last = 0u32;
            for _ in 0..n {
                last += decode_vbyte(self.data, &mut pos)?;
                list.push(last);
            }
            positions.push(list);
        }

        self.block_docs = docs;
        self.block_tfs = tfs;
        self.block_positions = positions;
        self.block_pos = 0;
        self.next_block = idx + 1;
        Ok(())
    }

    fn enter_block(&mut self, idx: usize) -> bool {
        match self.load_block(idx) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, block = idx, "Failed to decode posting block");
                false
            }
        }
    }
}

impl<'a> DocCursor for PostingIterator<'a> {
    fn doc(&self) -> Option<DocNo> {
        self.current
    }

    fn next_doc(&mut self) -> Option<DocNo> {
        if self.exhausted {
            return None;
        }
        if self.current.is_some() && self.block_pos + 1 < self.block_docs.len() {
            self.block_pos += 1;
        } else if self.next_block >= self.skip_entries.len() || !self.enter_block(self.next_block)
        {
            return self.finish();
        }
        self.current = Some(self.block_docs[self.block_pos]);
        self.current
    }

    fn seek(&mut self, target: DocNo) -> Option<DocNo> {
        if self.exhausted {
            return None;
        }
        if let Some(doc) = self.current {
            if doc >= target {
                return Some(doc);
            }
        }

        let in_current_block = self.current.is_some()
            && self.block_docs.last().map_or(false, |last| *last >= target);

        if !in_current_block {
            // Skip whole blocks whose max docno is below the target
            let Some(idx) = (self.next_block..self.skip_entries.len())
                .find(|&i| self.skip_entries[i].max_docno >= target)
            else {
                return self.finish();
            };
            if !self.enter_block(idx) {
                return self.finish();
            }
        }

        while self.block_docs[self.block_pos] < target {
            self.block_pos += 1;
        }
        self.current = Some(self.block_docs[self.block_pos]);
        self.current
    }
}

impl<'a> Iterator for PostingIterator<'a> {
    type Item = (DocNo, u32);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_doc().map(|doc| (doc, self.term_frequency()))
    }
}

/// Lazy conjunction of doc cursors.
///
/// Advances whichever cursor trails the current candidate with `seek` until
/// every cursor sits on the same docno, so the cost is bounded by the total
/// number of postings rather than their product.
pub struct Intersection<C: DocCursor> {
    cursors: Vec<C>,
    current: Option<DocNo>,
    exhausted: bool,
}

impl<C: DocCursor> Intersection<C> {
    pub fn new(cursors: Vec<C>) -> Self {
        let exhausted = cursors.is_empty();
        Self {
            cursors,
            current: None,
            exhausted,
        }
    }

    /// The underlying cursors, all positioned on the current docno
    pub fn cursors(&self) -> &[C] {
        &self.cursors
    }

    fn align(&mut self, mut target: DocNo) -> Option<DocNo> {
        'outer: loop {
            for cursor in self.cursors.iter_mut() {
                let Some(doc) = cursor.seek(target) else {
                    self.exhausted = true;
                    self.current = None;
                    return None;
                };
                if doc > target {
                    target = doc;
                    continue 'outer;
                }
            }
            self.current = Some(target);
            return self.current;
        }
    }
}

impl<C: DocCursor> DocCursor for Intersection<C> {
    fn doc(&self) -> Option<DocNo> {
        self.current
    }

    fn next_doc(&mut self) -> Option<DocNo> {
        if self.exhausted {
            return None;
        }
        let Some(first) = self.cursors[0].next_doc() else {
            self.exhausted = true;
            self.current = None;
            return None;
        };
        self.align(first)
    }

    fn seek(&mut self, target: DocNo) -> Option<DocNo> {
        if self.exhausted {
            return None;
        }
        if let Some(doc) = self.current {
            if doc >= target {
                return Some(doc);
            }
        }
        self.align(target)
    }
}

impl<C: DocCursor> Iterator for Intersection<C> {
    type Item = DocNo;

    fn next(&mut self) -> Option<DocNo> {
        self.next_doc()
    }
}

/// Convenience: intersect posting iterators into a list of docnos
pub fn intersect<'a>(iterators: Vec<PostingIterator<'a>>) -> Intersection<PostingIterator<'a>> {
    Intersection::new(iterators)
}
