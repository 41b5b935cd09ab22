use std::time::Instant;

#[derive(Debug, Default)]
pub struct GrabMetrics {
    pub frames_written: u64,
    pub bytes_written: u64,
    /// Polls that found no new frame
    pub empty_polls: u64,
    pub buffer_resizes: u64,
    pub start_time: Option<Instant>,
}

impl GrabMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn average_fps(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed > 0.0 {
            self.frames_written as f64 / elapsed
        } else {
            0.0
        }
    }
}
