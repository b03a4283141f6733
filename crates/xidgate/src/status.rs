use crate::{NodeId, TransactionId};
use core::fmt;
use core::time::Duration;

/// How a finish request was resolved.
///
/// None of these is a failure from the caller's point of view: the
/// transaction outcome is already decided locally, and a finish can only
/// affect how quickly the rest of the cluster learns about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FinishOutcome {
    /// Removed from the outstanding set and acknowledged upstream.
    Finished,
    /// The id was not outstanding. Usually a duplicate finish or a finish
    /// that crossed a sequencer reset.
    Stale,
    /// Removed locally but the upstream could not be told.
    Degraded,
}

/// A summary of sequencer state for the membership manager.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterStatus {
    pub locked: bool,
    pub ready: bool,
    pub generation: u64,
    pub pooled: usize,
    pub outstanding: usize,
    pub parked: usize,
    /// Newest id acknowledged as finished upstream.
    pub watermark: Option<TransactionId>,
    /// Newest id ever handed out.
    pub high_water: Option<TransactionId>,
}

/// One outstanding id in a [`SequencerDump`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutstandingRow {
    pub xid: TransactionId,
    pub owner: NodeId,
    pub age: Duration,
}

/// Operator-facing copy of the pool and outstanding set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SequencerDump {
    pub node_id: NodeId,
    pub status: ClusterStatus,
    pub replenishing: bool,
    /// Pooled ids in hand-out order.
    pub pool: Vec<TransactionId>,
    /// Outstanding ids, oldest first.
    pub outstanding: Vec<OutstandingRow>,
    /// Rows older than this are flagged as possible leaks.
    pub leak_after: Duration,
}

impl SequencerDump {
    /// Outstanding rows older than [`Self::leak_after`].
    pub fn suspected_leaks(&self) -> impl Iterator<Item = &OutstandingRow> {
        self.outstanding
            .iter()
            .filter(|row| row.age > self.leak_after)
    }
}

fn write_opt(f: &mut fmt::Formatter<'_>, id: Option<TransactionId>) -> fmt::Result {
    match id {
        Some(id) => write!(f, "{id}"),
        None => f.write_str("-"),
    }
}

impl fmt::Display for SequencerDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.status;
        writeln!(
            f,
            "sequencer node={} generation={} ready={} locked={} replenishing={} parked={}",
            self.node_id, s.generation, s.ready, s.locked, self.replenishing, s.parked
        )?;
        f.write_str("  watermark=")?;
        write_opt(f, s.watermark)?;
        f.write_str(" high_water=")?;
        write_opt(f, s.high_water)?;
        writeln!(f)?;

        write!(f, "  pool ({}):", self.pool.len())?;
        for id in &self.pool {
            write!(f, " {id}")?;
        }
        writeln!(f)?;

        writeln!(f, "  outstanding ({}):", self.outstanding.len())?;
        for row in &self.outstanding {
            write!(
                f,
                "    {} owner={} age={:.1}s",
                row.xid,
                row.owner,
                row.age.as_secs_f64()
            )?;
            if row.age > self.leak_after {
                f.write_str(" LEAK?")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_flags_old_rows() {
        let dump = SequencerDump {
            node_id: 0,
            status: ClusterStatus {
                locked: false,
                ready: true,
                generation: 1,
                pooled: 1,
                outstanding: 2,
                parked: 0,
                watermark: None,
                high_water: Some(TransactionId::from_raw(8)),
            },
            replenishing: false,
            pool: vec![TransactionId::from_raw(9)],
            outstanding: vec![
                OutstandingRow {
                    xid: TransactionId::from_raw(3),
                    owner: 2,
                    age: Duration::from_secs(600),
                },
                OutstandingRow {
                    xid: TransactionId::from_raw(8),
                    owner: 0,
                    age: Duration::from_millis(200),
                },
            ],
            leak_after: Duration::from_secs(60),
        };

        let text = dump.to_string();
        assert!(text.contains("watermark=- high_water=8"));
        assert!(text.contains("pool (1): 9"));
        assert!(text.contains("3 owner=2 age=600.0s LEAK?"));
        assert!(text.contains("8 owner=0 age=0.2s\n"));

        let leaks: Vec<_> = dump.suspected_leaks().map(|row| row.xid).collect();
        assert_eq!(leaks, vec![TransactionId::from_raw(3)]);
    }
}
