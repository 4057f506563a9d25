use stockflow_core::Aggregate;

/// Execute an aggregate command in place (no IO, no async).
///
/// Decides with `handle`, then evolves the aggregate with each emitted event.
/// Used by unit tests and by services that need to preview a decision before
/// committing it; the persisted path goes through the command dispatcher.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
