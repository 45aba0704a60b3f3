//! Raw PCM debug dumps
//!
//! When a dump directory is configured the worker appends every quantum's
//! microphone input, canceller output and conditioned reference to raw PCM
//! files, plus a CSV of the timestamp pair used for each quantum. Files from a
//! previous session are removed when the microphone is configured.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::Result;

pub const MIC_DUMP: &str = "aec_in.pcm";
pub const OUTPUT_DUMP: &str = "aec_out.pcm";
pub const REFERENCE_DUMP: &str = "aec_ref.pcm";
pub const TIMESTAMP_DUMP: &str = "aec_timestamps.txt";

pub struct DebugDump {
    mic: BufWriter<File>,
    output: BufWriter<File>,
    reference: BufWriter<File>,
    timestamps: BufWriter<File>,
    failed: bool,
}

impl DebugDump {
    /// Remove stale dumps in `dir` and open fresh ones
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        for name in [MIC_DUMP, OUTPUT_DUMP, REFERENCE_DUMP, TIMESTAMP_DUMP] {
            let path = dir.join(name);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }

        let open = |name: &str| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(dir.join(name))?))
        };
        let mut timestamps = open(TIMESTAMP_DUMP)?;
        writeln!(timestamps, "mic_time_us,reference_time_us")?;

        debug!("Writing AEC debug dumps to {}", dir.display());
        Ok(Self {
            mic: open(MIC_DUMP)?,
            output: open(OUTPUT_DUMP)?,
            reference: open(REFERENCE_DUMP)?,
            timestamps,
            failed: false,
        })
    }

    /// Append one quantum. `reference` is empty when none was conditioned.
    ///
    /// The first I/O error is logged and disables further dumping; dumps
    /// never fail the audio path.
    pub fn record(&mut self, mic: &[u8], output: &[u8], reference: &[i32], mic_time: u64, ref_time: u64) {
        if self.failed {
            return;
        }
        if let Err(e) = self.write_quantum(mic, output, reference, mic_time, ref_time) {
            warn!("Debug dump write failed, disabling dumps: {}", e);
            self.failed = true;
        }
    }

    fn write_quantum(
        &mut self,
        mic: &[u8],
        output: &[u8],
        reference: &[i32],
        mic_time: u64,
        ref_time: u64,
    ) -> std::io::Result<()> {
        self.mic.write_all(mic)?;
        self.output.write_all(output)?;
        for sample in reference {
            self.reference.write_all(&sample.to_le_bytes())?;
        }
        writeln!(self.timestamps, "{},{}", mic_time, ref_time)
    }

    pub fn flush(&mut self) {
        for writer in [&mut self.mic, &mut self.output, &mut self.reference, &mut self.timestamps] {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush debug dump: {}", e);
            }
        }
    }
}

impl Drop for DebugDump {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_replaces_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MIC_DUMP), b"stale data").unwrap();

        {
            let mut dump = DebugDump::create(dir.path()).unwrap();
            dump.record(&[1, 2, 3, 4], &[5, 6, 7, 8], &[1 << 16], 1_000, 1_020);
            dump.record(&[9, 9], &[0, 0], &[], 2_000, 0);
        }

        assert_eq!(fs::read(dir.path().join(MIC_DUMP)).unwrap(), vec![1, 2, 3, 4, 9, 9]);
        assert_eq!(fs::read(dir.path().join(OUTPUT_DUMP)).unwrap().len(), 6);
        assert_eq!(
            fs::read(dir.path().join(REFERENCE_DUMP)).unwrap(),
            (1i32 << 16).to_le_bytes().to_vec()
        );
        let csv = fs::read_to_string(dir.path().join(TIMESTAMP_DUMP)).unwrap();
        assert_eq!(csv, "mic_time_us,reference_time_us\n1000,1020\n2000,0\n");
    }
}
