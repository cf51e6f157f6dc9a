//! Bluetooth packet dump files for developer tooling.
//!
//! The format is line oriented: a header `PROFILE:CODEC[:HEX_CONFIG]`
//! followed by one `SIZE HEX_BYTES` line per Bluetooth packet.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::transport::{CodecId, Profile};

/// Incremental writer of one dump file.
#[derive(Debug)]
pub struct BtDump {
    out: BufWriter<File>,
}

impl BtDump {
    /// Create the dump file and write its header.
    pub fn create(
        path: &Path, profile: Profile, codec: CodecId, configuration: Option<&[u8]>,
    ) -> std::io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        match configuration {
            Some(config) => writeln!(out, "{profile}:{codec}:{}", hex::encode(config))?,
            None => writeln!(out, "{profile}:{codec}")?,
        }
        Ok(Self { out })
    }

    /// Append one Bluetooth packet.
    pub fn write(&mut self, packet: &[u8]) -> std::io::Result<()> {
        writeln!(self.out, "{} {}", packet.len(), hex::encode(packet))
    }

    /// Flush buffered lines to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_file_format() {
        let mut path = std::env::temp_dir();
        path.push(format!("bluealsa-dump-{}", std::process::id()));

        let mut dump =
            BtDump::create(&path, Profile::A2dpSink, CodecId::Sbc, Some(&[0x22, 0x15])).unwrap();
        dump.write(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        dump.write(&[0x01]).unwrap();
        dump.flush().unwrap();
        drop(dump);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a2dpsnk:SBC:2215\n4 deadbeef\n1 01\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn dump_header_without_configuration() {
        let mut path = std::env::temp_dir();
        path.push(format!("bluealsa-dump-nc-{}", std::process::id()));
        let dump = BtDump::create(&path, Profile::HfpAg, CodecId::Msbc, None).unwrap();
        drop(dump);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "hfpag:mSBC\n");
        std::fs::remove_file(&path).unwrap();
    }
}
