//! Progress reporting seam.
//!
//! The engine reports phase boundaries and completion counts through this
//! trait; rendering (dots, spinners, bars) is the caller's concern. The
//! default sink discards everything.

pub trait ProgressSink: Send {
    fn begin(&mut self, title: &str);
    fn update(&mut self, done: usize, total: usize);
    fn end(&mut self);
}

/// Discards all progress events.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin(&mut self, _title: &str) {}
    fn update(&mut self, _done: usize, _total: usize) {}
    fn end(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording(Vec<String>);

    impl ProgressSink for Recording {
        fn begin(&mut self, title: &str) {
            self.0.push(format!("begin {title}"));
        }
        fn update(&mut self, done: usize, total: usize) {
            self.0.push(format!("{done}/{total}"));
        }
        fn end(&mut self) {
            self.0.push("end".into());
        }
    }

    #[test]
    fn sink_receives_events_in_order() {
        let mut sink = Recording(Vec::new());
        sink.begin("phase");
        sink.update(1, 2);
        sink.update(2, 2);
        sink.end();
        assert_eq!(sink.0, ["begin phase", "1/2", "2/2", "end"]);
    }
}
