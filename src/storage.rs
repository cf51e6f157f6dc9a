//! Persistent per-device PCM settings.
//!
//! One INI file per remote device, named after its address, with one
//! section per PCM object path:
//!
//! ```ini
//! [/org/bluealsa/hci0/dev_12_34_56_78_9A_BC/a2dpsnk/source]
//! SoftVolume=true
//! Volume=-1200;-1200
//! Mute=false;false
//! DelayAdjustments=SBC:150;mSBC:0
//! ```
//!
//! Loading and saving an untouched file is byte stable: sections and keys
//! keep their order, values are re-emitted verbatim.

use std::{
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use crate::{
    pcm::TransportPcm,
    transport::CodecId,
    volume::ChannelVolume,
    Address,
};

/// Typed view of one PCM section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmSettings {
    /// Software volume flag.
    pub soft_volume: Option<bool>,
    /// Per-channel volume levels, dB * 100.
    pub volume: Vec<i32>,
    /// Per-channel soft mute flags.
    pub mute: Vec<bool>,
    /// Per-codec delay adjustments, tenths of a millisecond.
    pub delay_adjustments: Vec<(String, i16)>,
}

/// An INI settings file, order preserving.
#[derive(Debug, Default)]
pub struct Storage {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl Storage {
    /// Load the file; a missing file yields empty storage.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        let mut storage = Self::default();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                storage.sections.push((name.to_string(), Vec::new()));
            } else if let Some((key, value)) = line.split_once('=') {
                if let Some((_, keys)) = storage.sections.last_mut() {
                    keys.push((key.to_string(), value.to_string()));
                }
            }
        }
        Ok(storage)
    }

    /// Write the file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = Vec::new();
        for (name, keys) in &self.sections {
            writeln!(out, "[{name}]")?;
            for (key, value) in keys {
                writeln!(out, "{key}={value}")?;
            }
            writeln!(out)?;
        }
        std::fs::write(path, out)
    }

    fn section(&self, name: &str) -> Option<&Vec<(String, String)>> {
        self.sections.iter().find(|(n, _)| n == name).map(|(_, keys)| keys)
    }

    /// Typed settings of one PCM section.
    pub fn get(&self, section: &str) -> Option<PcmSettings> {
        let keys = self.section(section)?;
        let mut settings = PcmSettings::default();
        for (key, value) in keys {
            match key.as_str() {
                "SoftVolume" => settings.soft_volume = value.parse().ok(),
                "Volume" => {
                    settings.volume = value.split(';').filter_map(|v| v.parse().ok()).collect();
                }
                "Mute" => {
                    settings.mute = value.split(';').filter_map(|v| v.parse().ok()).collect();
                }
                "DelayAdjustments" => {
                    settings.delay_adjustments = value
                        .split(';')
                        .filter_map(|entry| {
                            let (codec, adj) = entry.split_once(':')?;
                            Some((codec.to_string(), adj.parse().ok()?))
                        })
                        .collect();
                }
                _ => (),
            }
        }
        Some(settings)
    }

    /// Install the typed settings as one PCM section.
    pub fn set(&mut self, section: &str, settings: &PcmSettings) {
        let keys = vec![
            ("SoftVolume".to_string(), settings.soft_volume.unwrap_or(false).to_string()),
            (
                "Volume".to_string(),
                settings.volume.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(";"),
            ),
            (
                "Mute".to_string(),
                settings.mute.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(";"),
            ),
            (
                "DelayAdjustments".to_string(),
                settings
                    .delay_adjustments
                    .iter()
                    .map(|(codec, adj)| format!("{codec}:{adj}"))
                    .collect::<Vec<_>>()
                    .join(";"),
            ),
        ];
        match self.sections.iter_mut().find(|(n, _)| n == section) {
            Some((_, existing)) => *existing = keys,
            None => self.sections.push((section.to_string(), keys)),
        }
    }
}

fn device_file(dir: &Path, address: Address) -> PathBuf {
    dir.join(address.to_string())
}

/// Transport creation hook: apply persisted settings to the PCM.
pub fn pcm_data_sync(dir: &Path, address: Address, pcm: &Arc<TransportPcm>) {
    let path = device_file(dir, address);
    let storage = match Storage::load(&path) {
        Ok(storage) => storage,
        Err(err) => {
            log::warn!("loading {}: {}", path.display(), err);
            return;
        }
    };
    let Some(settings) = storage.get(pcm.path()) else { return };
    if let Some(soft) = settings.soft_volume {
        pcm.set_soft_volume(soft);
    }
    let mut volume = pcm.volume();
    for (i, v) in volume.iter_mut().enumerate() {
        if let Some(level) = settings.volume.get(i) {
            v.set_level(*level);
        }
        if let Some(mute) = settings.mute.get(i) {
            v.set_mute(*mute, v.hard_mute);
        }
    }
    pcm.volume_update(volume);
    for (codec, adj) in &settings.delay_adjustments {
        if let Ok(codec) = CodecId::from_str(codec) {
            pcm.set_delay_adjustment(codec, *adj);
        }
    }
    log::debug!("{}: restored persisted settings", pcm.path());
}

/// Transport teardown hook: write the PCM settings back.
pub fn pcm_data_update(dir: &Path, address: Address, pcm: &Arc<TransportPcm>) {
    let path = device_file(dir, address);
    let mut storage = match Storage::load(&path) {
        Ok(storage) => storage,
        Err(err) => {
            log::warn!("loading {}: {}", path.display(), err);
            return;
        }
    };
    let channels = pcm.params().channels.min(2) as usize;
    let volume: Vec<ChannelVolume> = pcm.volume().into_iter().take(channels).collect();
    let mut adjustments: Vec<(String, i16)> =
        pcm.delay_adjustments().into_iter().map(|(codec, adj)| (codec.to_string(), adj)).collect();
    adjustments.sort();
    let settings = PcmSettings {
        soft_volume: Some(pcm.soft_volume()),
        volume: volume.iter().map(|v| v.level()).collect(),
        mute: volume.iter().map(|v| v.soft_mute).collect(),
        delay_adjustments: adjustments,
    };
    storage.set(pcm.path(), &settings);
    if let Err(err) = storage.save(&path) {
        log::warn!("saving {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("bluealsa-storage-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let path = temp_file("roundtrip");
        let mut storage = Storage::default();
        storage.set(
            "/org/bluealsa/hci0/dev_12_34_56_78_9A_BC/a2dpsnk/source",
            &PcmSettings {
                soft_volume: Some(true),
                volume: vec![-1200, -1200],
                mute: vec![false, false],
                delay_adjustments: vec![("SBC".into(), 150)],
            },
        );
        storage.set(
            "/org/bluealsa/hci0/dev_12_34_56_78_9A_BC/hfpag/sink",
            &PcmSettings {
                soft_volume: Some(false),
                volume: vec![0],
                mute: vec![true],
                delay_adjustments: vec![],
            },
        );
        storage.save(&path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded = Storage::load(&path).unwrap();
        loaded.save(&path).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn typed_section_access() {
        let mut storage = Storage::default();
        let settings = PcmSettings {
            soft_volume: Some(true),
            volume: vec![-600, -700],
            mute: vec![true, false],
            delay_adjustments: vec![("SBC".into(), 150), ("mSBC".into(), -20)],
        };
        storage.set("/some/pcm", &settings);
        assert_eq!(storage.get("/some/pcm").unwrap(), settings);
        assert!(storage.get("/other/pcm").is_none());
    }

    #[test]
    fn missing_file_loads_empty() {
        let storage = Storage::load(Path::new("/nonexistent/bluealsa/file")).unwrap();
        assert!(storage.get("/some/pcm").is_none());
    }

    #[test]
    fn settings_survive_transport_lifecycle() {
        let dir = temp_file("lifecycle-dir");
        let _ = std::fs::remove_dir_all(&dir);

        let mut config = crate::config::Config::default();
        config.storage_dir = Some(dir.clone());
        let t = crate::transport::test::a2dp_sink_transport(config.clone());
        let mut volume = t.pcm().volume();
        volume[0].set_level(-1234);
        volume[1].set_level(-1234);
        t.pcm().volume_update(volume);
        let pcm_path = t.pcm().path().to_string();
        t.destroy();

        let t2 = crate::transport::test::a2dp_sink_transport(config);
        assert_eq!(t2.pcm().path(), pcm_path);
        assert_eq!(t2.pcm().volume()[0].level(), -1234);
        t2.destroy();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
