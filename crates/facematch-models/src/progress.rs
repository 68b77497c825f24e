//! Percent-scale progress reporting for a single model attempt.
//!
//! Every attempt spends `[0, LOOKUP_END)` locating the model and
//! `[LOOKUP_END, 100]` fetching and deserializing it.

/// Percent at which locating the model is complete.
pub const LOOKUP_END: f32 = 20.0;

pub struct Progress<'a> {
    sink: &'a mut (dyn FnMut(u8) + Send),
    last: Option<u8>,
}

impl<'a> Progress<'a> {
    pub fn new(sink: &'a mut (dyn FnMut(u8) + Send)) -> Self {
        Self { sink, last: None }
    }

    /// Report an absolute percentage.
    ///
    /// Values at or below the last one reported in this attempt are dropped.
    pub fn report(&mut self, percent: f32) {
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        let value = percent.round() as u8;
        if self.last.map_or(true, |last| value > last) {
            self.last = Some(value);
            (self.sink)(value);
        }
    }

    /// Start of an attempt; the sink sees 0 again unless it already does.
    pub fn begin(&mut self) {
        if self.last != Some(0) {
            self.last = None;
            self.report(0.0);
        }
    }

    /// Locating finished; loading starts.
    pub fn located(&mut self) {
        self.report(LOOKUP_END);
    }

    /// Map a load fraction in [0, 1] onto `[LOOKUP_END, 100]`.
    pub fn loading(&mut self, fraction: f32) {
        self.report(LOOKUP_END + fraction.clamp(0.0, 1.0) * (100.0 - LOOKUP_END));
    }
}
