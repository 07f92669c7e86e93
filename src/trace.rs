//! Minimal instrumentation seam over function entry/exit and basic-block
//! transitions, with a no-op default so embedding code pays nothing unless
//! it opts into recording.

/// Implemented by embedders that want visibility into evaluation; the
/// default `NoopTracer` costs nothing.
pub trait VmTracer {
    fn on_call_enter(&mut self, _name: &str) {}
    fn on_call_exit(&mut self, _name: &str) {}
    fn on_basic_block_enter(&mut self, _function: &str, _block_id: usize) {}
}

pub struct NoopTracer;
impl VmTracer for NoopTracer {}

/// Records `(function, block_id)` transitions in order, useful in tests that
/// assert on control-flow shape without re-deriving it from the IR.
#[derive(Default)]
pub struct RecordingTracer {
    pub calls: Vec<String>,
    pub blocks: Vec<(String, usize)>,
}

impl VmTracer for RecordingTracer {
    fn on_call_enter(&mut self, name: &str) {
        self.calls.push(format!("enter:{name}"));
    }
    fn on_call_exit(&mut self, name: &str) {
        self.calls.push(format!("exit:{name}"));
    }
    fn on_basic_block_enter(&mut self, function: &str, block_id: usize) {
        self.blocks.push((function.to_string(), block_id));
    }
}
