//! Resource states and the per-subresource tracking that barriers update.

use crate::error::{Error, Result};

/// The access and layout the GPU currently grants a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    #[default]
    Undefined,
    Common,
    TransferSrc,
    TransferDst,
    ColorWrite,
    DepthWrite,
    DepthRead,
    ShaderRead,
    ShaderReadWrite,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    IndirectArgument,
    AccelerationStructureBuildInput,
    AccelerationStructureRead,
    AccelerationStructureWrite,
    Present,
}

impl ResourceState {
    pub fn valid_for_image(self) -> bool {
        !matches!(
            self,
            ResourceState::VertexBuffer
                | ResourceState::IndexBuffer
                | ResourceState::ConstantBuffer
                | ResourceState::IndirectArgument
                | ResourceState::AccelerationStructureBuildInput
                | ResourceState::AccelerationStructureRead
                | ResourceState::AccelerationStructureWrite
        )
    }

    pub fn valid_for_buffer(self) -> bool {
        !matches!(
            self,
            ResourceState::ColorWrite | ResourceState::DepthWrite | ResourceState::DepthRead | ResourceState::Present
        )
    }

    pub fn is_copy_source(self) -> bool {
        matches!(self, ResourceState::TransferSrc | ResourceState::Common)
    }

    pub fn is_copy_destination(self) -> bool {
        matches!(self, ResourceState::TransferDst | ResourceState::Common)
    }

    pub fn is_depth_attachment(self) -> bool {
        matches!(self, ResourceState::DepthWrite | ResourceState::DepthRead)
    }
}

/// The `src` side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Resolve to the last tracked state.
    Current,
    /// Trust the caller; the tracked state is ignored.
    Known(ResourceState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Subresource {
    pub mip: u32,
    pub layer: u32,
}

impl Subresource {
    pub fn new(mip: u32, layer: u32) -> Self {
        Self { mip, layer }
    }
}

/// A rectangular block of mips and layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn single(sub: Subresource) -> Self {
        Self {
            base_mip: sub.mip,
            mip_count: 1,
            base_layer: sub.layer,
            layer_count: 1,
        }
    }

    pub fn contains(&self, sub: Subresource) -> bool {
        (self.base_mip..self.base_mip + self.mip_count).contains(&sub.mip)
            && (self.base_layer..self.base_layer + self.layer_count).contains(&sub.layer)
    }

    pub fn iter(&self) -> impl Iterator<Item = Subresource> + '_ {
        let layers = self.base_layer..self.base_layer + self.layer_count;
        (self.base_mip..self.base_mip + self.mip_count)
            .flat_map(move |mip| layers.clone().map(move |layer| Subresource { mip, layer }))
    }
}

/// One native transition: every subresource in `range` goes `from → to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub range: SubresourceRange,
    pub from: ResourceState,
    pub to: ResourceState,
}

/// Tracked state of every (mip, layer) of an image. Buffers use a 1x1 grid.
#[derive(Debug, Clone)]
pub struct SubresourceStates {
    mip_levels: u32,
    array_layers: u32,
    states: Vec<ResourceState>,
}

impl SubresourceStates {
    pub fn new(mip_levels: u32, array_layers: u32, initial: ResourceState) -> Self {
        Self {
            mip_levels,
            array_layers,
            states: vec![initial; (mip_levels * array_layers) as usize],
        }
    }

    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange {
            base_mip: 0,
            mip_count: self.mip_levels,
            base_layer: 0,
            layer_count: self.array_layers,
        }
    }

    fn index(&self, sub: Subresource) -> Result<usize> {
        if sub.mip >= self.mip_levels || sub.layer >= self.array_layers {
            return Err(Error::invalid(format!(
                "Subresource (mip {}, layer {}) outside {} mips x {} layers",
                sub.mip, sub.layer, self.mip_levels, self.array_layers
            )));
        }
        Ok((sub.mip * self.array_layers + sub.layer) as usize)
    }

    pub fn validate_range(&self, range: SubresourceRange) -> Result<()> {
        let mips_end = range.base_mip.checked_add(range.mip_count);
        let layers_end = range.base_layer.checked_add(range.layer_count);
        if range.mip_count == 0
            || range.layer_count == 0
            || mips_end.is_none_or(|end| end > self.mip_levels)
            || layers_end.is_none_or(|end| end > self.array_layers)
        {
            return Err(Error::invalid(format!(
                "Subresource range {range:?} outside {} mips x {} layers",
                self.mip_levels, self.array_layers
            )));
        }
        Ok(())
    }

    pub fn get(&self, sub: Subresource) -> Result<ResourceState> {
        Ok(self.states[self.index(sub)?])
    }

    /// Tracked state shared by every subresource of `range`, if uniform.
    pub fn uniform_state(&self, range: SubresourceRange) -> Option<ResourceState> {
        let mut iter = range.iter().filter_map(|s| self.index(s).ok()).map(|i| self.states[i]);
        let first = iter.next()?;
        iter.all(|s| s == first).then_some(first)
    }

    /// Native transitions needed to move `range` to `dst`.
    ///
    /// A known source or a uniformly tracked range yields one transition for
    /// the whole range; mixed tracked states yield one per subresource.
    pub fn plan(&self, range: SubresourceRange, src: SourceState, dst: ResourceState) -> Result<Vec<StateTransition>> {
        self.validate_range(range)?;
        match src {
            SourceState::Known(from) => Ok(vec![StateTransition { range, from, to: dst }]),
            SourceState::Current => {
                if let Some(from) = self.uniform_state(range) {
                    return Ok(vec![StateTransition { range, from, to: dst }]);
                }
                range
                    .iter()
                    .map(|sub| {
                        Ok(StateTransition {
                            range: SubresourceRange::single(sub),
                            from: self.get(sub)?,
                            to: dst,
                        })
                    })
                    .collect()
            }
        }
    }

    pub fn apply(&mut self, range: SubresourceRange, dst: ResourceState) -> Result<()> {
        self.validate_range(range)?;
        for sub in range.iter() {
            let i = self.index(sub)?;
            self.states[i] = dst;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_validity_per_kind() {
        assert!(!ResourceState::Present.valid_for_buffer());
        assert!(!ResourceState::VertexBuffer.valid_for_image());
        assert!(ResourceState::ShaderRead.valid_for_image());
        assert!(ResourceState::ShaderRead.valid_for_buffer());
        assert!(ResourceState::AccelerationStructureRead.valid_for_buffer());
    }

    #[test]
    fn mixed_states_plan_per_subresource() {
        let mut states = SubresourceStates::new(2, 2, ResourceState::Undefined);
        states
            .apply(SubresourceRange::single(Subresource::new(1, 0)), ResourceState::ShaderRead)
            .unwrap();
        let full = states.full_range();
        let plan = states.plan(full, SourceState::Current, ResourceState::TransferDst).unwrap();
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().any(|t| t.from == ResourceState::ShaderRead
            && t.range == SubresourceRange::single(Subresource::new(1, 0))));
        states.apply(full, ResourceState::TransferDst).unwrap();
        assert_eq!(states.uniform_state(full), Some(ResourceState::TransferDst));
    }

    #[test]
    fn uniform_or_known_source_plans_one_transition() {
        let states = SubresourceStates::new(3, 1, ResourceState::Common);
        let full = states.full_range();
        let plan = states.plan(full, SourceState::Current, ResourceState::ShaderRead).unwrap();
        let expected = StateTransition { range: full, from: ResourceState::Common, to: ResourceState::ShaderRead };
        assert_eq!(plan, vec![expected]);
        let plan = states
            .plan(full, SourceState::Known(ResourceState::Undefined), ResourceState::ShaderRead)
            .unwrap();
        assert_eq!(plan[0].from, ResourceState::Undefined);
    }

    #[test]
    fn subresource_apply_touches_only_that_subresource() {
        let mut states = SubresourceStates::new(2, 3, ResourceState::Undefined);
        states
            .apply(SubresourceRange::single(Subresource::new(0, 2)), ResourceState::ColorWrite)
            .unwrap();
        assert_eq!(states.get(Subresource::new(0, 2)).unwrap(), ResourceState::ColorWrite);
        assert_eq!(states.get(Subresource::new(0, 1)).unwrap(), ResourceState::Undefined);
        assert_eq!(states.get(Subresource::new(1, 2)).unwrap(), ResourceState::Undefined);
    }

    #[test]
    fn out_of_range_subresource_is_invalid() {
        let states = SubresourceStates::new(1, 1, ResourceState::Undefined);
        assert!(states.get(Subresource::new(1, 0)).is_err());
        let bad = SubresourceRange { base_mip: 0, mip_count: 2, base_layer: 0, layer_count: 1 };
        assert!(states.plan(bad, SourceState::Current, ResourceState::Common).is_err());
    }

    #[test]
    fn overflowing_range_is_invalid() {
        let mut states = SubresourceStates::new(2, 2, ResourceState::Undefined);
        let mips = SubresourceRange { base_mip: u32::MAX, mip_count: 1, base_layer: 0, layer_count: 1 };
        let err = states.plan(mips, SourceState::Current, ResourceState::Common).unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
        let layers = SubresourceRange { base_mip: 0, mip_count: 1, base_layer: 1, layer_count: u32::MAX };
        assert!(states.apply(layers, ResourceState::Common).is_err());
        assert_eq!(states.uniform_state(states.full_range()), Some(ResourceState::Undefined));
    }
}
