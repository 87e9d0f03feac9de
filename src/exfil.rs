//! Getting converted blocks out of the ring buffer and onto disk

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use byte_slice_cast::*;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, info};

use crate::capture::OwnedBlock;

/// How long an idle consumer naps before polling the ring again
const IDLE_SLEEP: Duration = Duration::from_micros(200);

pub fn file_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}-{:02}-{:02}-{:02}{:02}{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Path of a new recording in `dir`, named by start time
pub fn recording_path(dir: &Path, time: &DateTime<Utc>) -> PathBuf {
    dir.join(format!("rcb-{}.f32", file_timestamp(time)))
}

/// Raw native-endian f32 writer. Each block is written channel-major, so a
/// reader needs the channel count and samples per packet to split it back up.
pub struct BlockWriter<W: Write> {
    inner: W,
    blocks: u64,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, blocks: 0 }
    }

    pub fn write_block(&mut self, block: &OwnedBlock) -> io::Result<()> {
        self.inner.write_all(block.data.as_byte_slice())?;
        self.blocks += 1;
        Ok(())
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Pop until `stop` is set and the ring has drained, handing every block to `f`
fn drain<F>(mut consumer: rtrb::Consumer<OwnedBlock>, stop: &AtomicBool, mut f: F) -> io::Result<()>
where
    F: FnMut(OwnedBlock) -> io::Result<()>,
{
    loop {
        match consumer.pop() {
            Ok(block) => f(block)?,
            Err(_) if stop.load(Ordering::Relaxed) => return Ok(()),
            Err(_) => thread::sleep(IDLE_SLEEP),
        }
    }
}

/// Write every block to a new file in `dir`. Returns the number of blocks written.
pub fn file_consumer(
    consumer: rtrb::Consumer<OwnedBlock>,
    dir: &Path,
    stop: Arc<AtomicBool>,
) -> io::Result<u64> {
    let path = recording_path(dir, &Utc::now());
    let mut writer = BlockWriter::new(BufWriter::new(File::create(&path)?));
    info!("Recording to {}", path.display());
    drain(consumer, &stop, |block| writer.write_block(&block))?;
    let blocks = writer.blocks();
    writer.into_inner()?;
    info!(blocks, "Recording closed");
    Ok(blocks)
}

/// Throw blocks away as fast as they come in
pub fn consume_and_drop(consumer: rtrb::Consumer<OwnedBlock>, stop: Arc<AtomicBool>) -> u64 {
    let mut dropped = 0;
    // Dropping can't fail
    let _ = drain(consumer, &stop, |_| {
        dropped += 1;
        Ok(())
    });
    debug!(dropped, "Drop consumer exiting");
    dropped
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn block(value: f32) -> OwnedBlock {
        OwnedBlock {
            channels: 2,
            samples: 3,
            data: vec![value; 6],
            sample_numbers: vec![0, 1, 2],
            timestamps: vec![0.0; 3],
            event_words: vec![0; 3],
            aux_slots: vec![],
        }
    }

    #[test]
    fn test_file_name() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(file_timestamp(&t), "2024-03-07-090501");
        assert_eq!(
            recording_path(Path::new("/data"), &t),
            PathBuf::from("/data/rcb-2024-03-07-090501.f32")
        );
    }

    #[test]
    fn test_writer_layout() {
        let mut writer = BlockWriter::new(vec![]);
        writer.write_block(&block(1.5)).unwrap();
        writer.write_block(&block(-2.0)).unwrap();
        assert_eq!(writer.blocks(), 2);
        let bytes = writer.into_inner().unwrap();
        assert_eq!(bytes.len(), 2 * 6 * 4);
        let value = |i: usize| f32::from_ne_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(value(0), 1.5);
        assert_eq!(value(5), 1.5);
        assert_eq!(value(11), -2.0);
    }

    #[test]
    fn test_drop_consumer_drains() {
        let (mut producer, consumer) = rtrb::RingBuffer::new(4);
        for i in 0..3 {
            producer.push(block(i as f32)).unwrap();
        }
        let stop = Arc::new(AtomicBool::new(true));
        assert_eq!(consume_and_drop(consumer, stop), 3);
    }
}
