use std::fs;

/// Full-resolution buffers a worker holds at once: grayscale query,
/// unchanged query, warped output and the reference grayscale.
const BUFFERS_PER_WORKER: f64 = 4.0;

/// Get available system memory in GB
pub fn get_available_memory_gb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = fs::read_to_string("/proc/meminfo") {
            if let Some(gb) = parse_meminfo_available_gb(&content) {
                return gb;
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        use std::process::Command;
        if let Ok(output) = Command::new("sysctl").arg("-n").arg("hw.memsize").output() {
            if let Ok(size_str) = String::from_utf8(output.stdout) {
                if let Ok(bytes) = size_str.trim().parse::<f64>() {
                    return bytes / 1024.0 / 1024.0 / 1024.0;
                }
            }
        }
    }

    // Fallback: assume 8GB available
    8.0
}

fn parse_meminfo_available_gb(content: &str) -> Option<f64> {
    content
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<f64>().ok())
        .map(|kb| kb / 1024.0 / 1024.0)
}

/// Estimate image size in MB based on dimensions
pub fn estimate_image_size_mb(width: i32, height: i32, channels: i32, bytes_per_channel: i32) -> f64 {
    // Raw pixel data + overhead for OpenCV Mat structures
    let raw_size = width as f64 * height as f64 * channels as f64 * bytes_per_channel as f64;
    let mb = raw_size / (1024.0 * 1024.0);
    mb * 1.5
}

/// Number of workers that fit in memory and on the available cores.
///
/// An explicit `requested` count wins. Otherwise half of the available RAM is
/// divided by the per-worker working set, and the result is capped by the
/// core count and `max_workers`.
pub fn resolve_worker_count(
    requested: Option<usize>,
    max_workers: usize,
    available_gb: f64,
    image_size_mb: f64,
) -> usize {
    if let Some(n) = requested {
        return n.max(1);
    }

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let usable_mb = available_gb * 0.5 * 1024.0;
    let per_worker_mb = (image_size_mb * BUFFERS_PER_WORKER).max(1.0);
    let memory_cap = (usable_mb / per_worker_mb).floor() as usize;

    log::info!(
        "Worker sizing: {} cores, {:.2} GB RAM available, ~{:.1} MB per worker",
        cores,
        available_gb,
        per_worker_mb
    );

    cores.min(memory_cap).min(max_workers).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8388608 kB\n";
        let gb = parse_meminfo_available_gb(content).unwrap();
        assert!((gb - 8.0).abs() < 1e-9);
        assert!(parse_meminfo_available_gb("MemTotal: 1 kB\n").is_none());
    }

    #[test]
    fn test_explicit_worker_count_wins() {
        assert_eq!(resolve_worker_count(Some(3), 8, 0.1, 10_000.0), 3);
        assert_eq!(resolve_worker_count(Some(0), 8, 64.0, 1.0), 1);
    }

    #[test]
    fn test_memory_caps_worker_count() {
        // 1 GB usable, 4 x 200 MB per worker -> 1 worker
        assert_eq!(resolve_worker_count(None, 8, 2.0, 200.0), 1);
        let roomy = resolve_worker_count(None, 2, 512.0, 1.0);
        assert!(roomy >= 1 && roomy <= 2);
    }

    #[test]
    fn test_image_size_estimate() {
        let mb = estimate_image_size_mb(1024, 1024, 3, 2);
        assert!((mb - 9.0).abs() < 1e-9);
    }
}
