//! Process groups of a shot-parallel inversion.
//!
//! Shots are distributed over shot domains. Ranks inside a shot domain share one
//! model partition; the inter-shot group connects the ranks that hold the same
//! partition in every shot domain and is used to reduce gradients across shots.

use std::sync::Arc;

use ndarray::Array2;

/// Collective operations over one process group.
///
/// All members must call every method in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Elementwise sum of `values` over the group, result on every member.
    fn sum_in_place(&self, values: &mut [f64]);
    /// True on every member if `flag` is true on any member.
    fn any(&self, flag: bool) -> bool;
}

/// A group with a single member.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum_in_place(&self, _values: &mut [f64]) {}

    fn any(&self, flag: bool) -> bool {
        flag
    }
}

/// Built once at startup and passed down to every component that reduces.
#[derive(Clone)]
pub struct ShotTopology {
    shot: Arc<dyn Communicator>,
    inter_shot: Arc<dyn Communicator>,
    num_shot_domains: usize,
    shot_domain: usize,
}

impl ShotTopology {
    pub fn new(
        shot: Arc<dyn Communicator>,
        inter_shot: Arc<dyn Communicator>,
        num_shot_domains: usize,
        shot_domain: usize,
    ) -> Self {
        ShotTopology {
            shot,
            inter_shot,
            num_shot_domains: num_shot_domains.max(1),
            shot_domain,
        }
    }

    pub fn single() -> Self {
        Self::new(Arc::new(LocalCommunicator), Arc::new(LocalCommunicator), 1, 0)
    }

    pub fn shot(&self) -> &dyn Communicator {
        self.shot.as_ref()
    }

    pub fn inter_shot(&self) -> &dyn Communicator {
        self.inter_shot.as_ref()
    }

    /// Only one rank writes shared artifacts.
    pub fn is_writer(&self) -> bool {
        self.shot.rank() == 0 && self.inter_shot.rank() == 0
    }

    /// Shots handled by this shot domain (round robin).
    pub fn assigned_shots(&self, num_shots: usize) -> Vec<usize> {
        (0..num_shots)
            .filter(|s| s % self.num_shot_domains == self.shot_domain)
            .collect()
    }

    /// Average of `values` over the inter-shot group.
    ///
    /// Every shot domain holds a copy of the same partition, so sum-and-divide
    /// cancels the duplication before a grid transform is applied.
    pub fn average_over_shot_domains(&self, values: &mut [f64]) {
        self.inter_shot.sum_in_place(values);
        let size = self.inter_shot.size() as f64;
        values.iter_mut().for_each(|v| *v /= size);
    }

    /// [`average_over_shot_domains`](Self::average_over_shot_domains) of a whole field.
    pub fn average_field(&self, field: &mut Array2<f64>) {
        sum_field(self.inter_shot(), field);
        let size = self.inter_shot.size() as f64;
        field.mapv_inplace(|v| v / size);
    }
}

/// Elementwise sum of a field over the group.
pub fn sum_field(comm: &dyn Communicator, field: &mut Array2<f64>) {
    match field.as_slice_mut() {
        Some(values) => comm.sum_in_place(values),
        None => {
            let mut values: Vec<f64> = field.iter().copied().collect();
            comm.sum_in_place(&mut values);
            field.iter_mut().zip(values).for_each(|(v, s)| *v = s);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ReplicatedCommunicator;
    use super::*;

    #[test]
    fn shots_are_split_round_robin() {
        let topo = ShotTopology::new(
            Arc::new(LocalCommunicator),
            Arc::new(LocalCommunicator),
            3,
            1,
        );
        assert_eq!(topo.assigned_shots(7), vec![1, 4]);
        assert_eq!(ShotTopology::single().assigned_shots(3), vec![0, 1, 2]);
    }

    #[test]
    fn averaging_cancels_replication() {
        let topo = ShotTopology::new(
            Arc::new(LocalCommunicator),
            Arc::new(ReplicatedCommunicator { size: 4 }),
            4,
            0,
        );
        let mut values = vec![1.5, -2.0, 3.0];
        topo.average_over_shot_domains(&mut values);
        assert_eq!(values, vec![1.5, -2.0, 3.0]);
    }
}
