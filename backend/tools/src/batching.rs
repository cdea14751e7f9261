/// Groups the tool calls of one model response into execution batches.
///
/// Runs of side-effect-free calls share a batch and execute concurrently.
/// Every other call gets a batch of its own, so writes keep the order the
/// model asked for and never race a read issued after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBatch<T> {
    pub parallel: bool,
    pub calls: Vec<T>,
}

pub fn plan_batches<T>(calls: Vec<T>, side_effect_free: impl Fn(&T) -> bool) -> Vec<ToolBatch<T>> {
    let mut batches: Vec<ToolBatch<T>> = Vec::new();
    for call in calls {
        let safe = side_effect_free(&call);
        match batches.last_mut() {
            Some(last) if safe && last.parallel => last.calls.push(call),
            _ => batches.push(ToolBatch {
                parallel: safe,
                calls: vec![call],
            }),
        }
    }
    batches
}
