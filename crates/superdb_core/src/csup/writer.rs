use std::io::Write;

use superdb_error::{Result, ResultExt};
use tracing::debug;

use super::encoder::{DynamicEncoder, Segments};
use super::{DEFAULT_OBJECT_VALUES, HEADER_SIZE, Header, VERSION};
use crate::bsup;
use crate::io::ValueWriter;
use crate::types::TypeContext;
use crate::value::Value;

/// Buffers values into column encoders and writes a CSUP object each time
/// the buffered value count reaches the object threshold.
pub struct Writer<W: Write + Send> {
    out: W,
    encoder: DynamicEncoder,
    object_values: usize,
    objects: usize,
}

impl<W: Write + Send> Writer<W> {
    pub fn new(out: W) -> Self {
        Writer {
            out,
            encoder: DynamicEncoder::new(),
            object_values: DEFAULT_OBJECT_VALUES,
            objects: 0,
        }
    }

    pub fn with_object_values(mut self, n: usize) -> Self {
        self.object_values = n.max(1);
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Number of objects written so far.
    pub fn objects(&self) -> usize {
        self.objects
    }

    fn flush_object(&mut self) -> Result<()> {
        if self.encoder.is_empty() {
            return Ok(());
        }
        let encoder = std::mem::take(&mut self.encoder);
        let values = encoder.len();
        let mut segs = Segments::default();
        let mut nodes = Vec::new();
        let root = encoder.metadata(&mut segs, &mut nodes)?;
        let data = segs.finish(&mut nodes)?;

        let ctx = TypeContext::new();
        let mut meta = bsup::Writer::new(Vec::new()).with_compression(true);
        for node in &nodes {
            meta.write(&node.to_value(&ctx)?)?;
        }
        meta.end_stream()?;
        let meta = meta.into_inner();

        let header = Header {
            version: VERSION,
            meta_size: meta.len() as u64,
            data_size: data.len() as u64,
            root,
        };
        let hdr: [u8; HEADER_SIZE] = header.serialize();
        self.out.write_all(&hdr).context("failed to write CSUP header")?;
        self.out.write_all(&meta).context("failed to write CSUP metadata")?;
        self.out.write_all(&data).context("failed to write CSUP data")?;
        self.objects += 1;
        debug!(
            values,
            nodes = nodes.len(),
            meta_size = meta.len(),
            data_size = data.len(),
            "flushed csup object"
        );
        Ok(())
    }
}

impl<W: Write + Send> ValueWriter for Writer<W> {
    fn write(&mut self, val: &Value) -> Result<()> {
        self.encoder.write(val)?;
        if self.encoder.len() >= self.object_values {
            self.flush_object()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush_object()?;
        self.out.flush().context("failed to flush CSUP output")
    }
}
