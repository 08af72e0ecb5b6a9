//! Throttled download progress.

use crate::log::Reporter;

/// Progress is reported at most every this many bytes when the total is unknown.
const UNKNOWN_LENGTH_STEP: u64 = 8 * 1024 * 1024;

/// Emits a progress event each time a download crosses the next step.
#[derive(Debug)]
pub(crate) struct DownloadProgress {
  label: String,
  total: Option<u64>,
  step_percent: u64,
  next_mark: u64,
}

impl DownloadProgress {
  /// `already` is the number of bytes on disk before this transfer started.
  pub(crate) fn new(label: impl Into<String>, total: Option<u64>, step_percent: u8, already: u64) -> Self {
    let step_percent = u64::from(step_percent.clamp(1, 100));
    let mut progress = Self {
      label: label.into(),
      total: total.filter(|t| *t > 0),
      step_percent,
      next_mark: 0,
    };
    progress.next_mark = progress.mark_after(already);
    progress
  }

  pub(crate) fn advance(&mut self, written: u64, reporter: &Reporter) {
    if written < self.next_mark {
      return;
    }
    match self.total {
      Some(total) => {
        let percent = (written.min(total) * 100 / total).min(100);
        reporter.info(format!(
          "{}: {percent}% ({} of {})",
          self.label,
          format_bytes(written),
          format_bytes(total)
        ));
      }
      None => reporter.info(format!("{}: {} downloaded", self.label, format_bytes(written))),
    }
    self.next_mark = self.mark_after(written);
  }

  /// First byte count past `written` that should be reported.
  fn mark_after(&self, written: u64) -> u64 {
    match self.total {
      Some(total) => {
        let percent = written.min(total) * 100 / total;
        let next_percent = (percent / self.step_percent + 1) * self.step_percent;
        let mark = if next_percent >= 100 {
          total
        } else {
          (next_percent * total).div_ceil(100)
        };
        mark.max(written + 1)
      }
      None => (written / UNKNOWN_LENGTH_STEP + 1) * UNKNOWN_LENGTH_STEP,
    }
  }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
  const KIB: f64 = 1024.0;
  const MIB: f64 = KIB * 1024.0;
  const GIB: f64 = MIB * 1024.0;

  let b = bytes as f64;
  if b >= GIB {
    format!("{:.1} GiB", b / GIB)
  } else if b >= MIB {
    format!("{:.1} MiB", b / MIB)
  } else if b >= KIB {
    format!("{:.1} KiB", b / KIB)
  } else {
    format!("{bytes} B")
  }
}
