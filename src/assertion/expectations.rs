use std::fmt;

use crate::isolation::TransactionIsolation;

/// The anomalies a scenario can probe for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnomalyClass {
    /// Observing another transaction's uncommitted write.
    DirtyRead,
    /// Re-reading a row inside one transaction and getting a value another
    /// transaction committed in between.
    NonRepeatableRead,
    /// Re-running a range query and getting rows another transaction inserted
    /// or deleted in between.
    PhantomRead,
    /// The engine refusing a conflicting write (deadlock or lock wait timeout)
    /// instead of letting it through.
    SerializationFailure,
}

impl AnomalyClass {
    pub const ALL: [AnomalyClass; 4] = [
        AnomalyClass::DirtyRead,
        AnomalyClass::NonRepeatableRead,
        AnomalyClass::PhantomRead,
        AnomalyClass::SerializationFailure,
    ];
}

impl fmt::Display for AnomalyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnomalyClass::DirtyRead => "dirty read",
            AnomalyClass::NonRepeatableRead => "non-repeatable read",
            AnomalyClass::PhantomRead => "phantom read",
            AnomalyClass::SerializationFailure => "serialization failure",
        };
        f.write_str(name)
    }
}

/// What a level is expected to do about an anomaly in a scripted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expected {
    /// The level permits it and the script is built to make it happen.
    Exhibited,
    /// The level forbids it.
    Prevented,
    /// The standard leaves it to the engine; reported, never asserted.
    EngineDefined,
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Exhibited => f.write_str("exhibited"),
            Expected::Prevented => f.write_str("prevented"),
            Expected::EngineDefined => f.write_str("engine-defined"),
        }
    }
}

/// The canonical behaviour of `level` with respect to `class`.
///
/// ```text
///                    dirty      non-repeatable  phantom         serialization failure
/// READ UNCOMMITTED   exhibited  exhibited       exhibited       engine-defined
/// READ COMMITTED     prevented  exhibited       exhibited       engine-defined
/// REPEATABLE READ    prevented  prevented       engine-defined  engine-defined
/// SERIALIZABLE       prevented  prevented       prevented       exhibited
/// ```
pub fn expectation(level: TransactionIsolation, class: AnomalyClass) -> Expected {
    use AnomalyClass::*;
    use TransactionIsolation::*;

    match (level, class) {
        (ReadUncommitted, DirtyRead | NonRepeatableRead | PhantomRead) => Expected::Exhibited,
        (ReadCommitted, DirtyRead) => Expected::Prevented,
        (ReadCommitted, NonRepeatableRead | PhantomRead) => Expected::Exhibited,
        (RepeatableRead, DirtyRead | NonRepeatableRead) => Expected::Prevented,
        (RepeatableRead, PhantomRead) => Expected::EngineDefined,
        (Serializable, DirtyRead | NonRepeatableRead | PhantomRead) => Expected::Prevented,
        (Serializable, SerializationFailure) => Expected::Exhibited,
        (ReadUncommitted | ReadCommitted | RepeatableRead, SerializationFailure) => {
            Expected::EngineDefined
        }
    }
}
