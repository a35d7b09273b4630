// Descriptor storage and binding model
//
// A DescriptorSetLayout is the static shape of one binding group. A
// DescriptorStorage is a pool sized up front from which sets are carved; sets
// are never freed one by one, the whole storage is reset as a unit. Writes into
// a set are eager host-side operations on both backends.

use std::collections::BTreeMap;

use anyhow::Result;
use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use crate::error::{exhausted, violation};
use crate::keys::{
    BufferKey, BufferViewKey, DescriptorSetKey, DescriptorStorageKey, ImageViewKey, SamplerKey,
    SetLayoutKey,
};
use crate::resource::{Buffer, BufferView, ImageView, Sampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BindingKind {
    ConstantBuffer,
    SampledImage,
    Sampler,
    StorageBuffer,
    StorageImage,
    UniformTexelBuffer,
    InputAttachment,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL = Self::ALL_GRAPHICS.bits() | Self::COMPUTE.bits();
    }
}

/// `count` consecutive descriptors of one kind at shader binding `binding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub kind: BindingKind,
    pub binding: u32,
    pub count: u32,
}

/// Declarative description of a set layout.
///
/// Pure value: two call sites that build the same description get layouts
/// that are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetDescription {
    pub ranges: Vec<DescriptorRange>,
    pub stages: ShaderStages,
}

impl DescriptorSetDescription {
    pub fn new(stages: ShaderStages) -> Self {
        Self { ranges: Vec::new(), stages }
    }

    pub fn with(mut self, kind: BindingKind, binding: u32, count: u32) -> Self {
        self.ranges.push(DescriptorRange { kind, binding, count });
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ranges.is_empty() {
            violation!("descriptor set description declares no binding");
        }
        if self.stages.is_empty() {
            violation!("descriptor set description is visible to no shader stage");
        }
        let mut seen = std::collections::HashSet::new();
        for range in &self.ranges {
            if range.count == 0 {
                violation!("binding {} declares zero descriptors", range.binding);
            }
            if !seen.insert(range.binding) {
                violation!("binding {} is declared twice", range.binding);
            }
            if range.kind == BindingKind::InputAttachment && self.stages != ShaderStages::FRAGMENT {
                violation!(
                    "input attachment binding {} must be visible to the fragment stage only",
                    range.binding
                );
            }
        }
        Ok(())
    }

    /// Flatten the ranges into addressable slots, in declaration order.
    pub fn slots(&self) -> Vec<DescriptorSlot> {
        self.ranges
            .iter()
            .flat_map(|range| {
                (0..range.count).map(move |array_element| DescriptorSlot {
                    kind: range.kind,
                    binding: range.binding,
                    array_element,
                })
            })
            .collect()
    }

    /// Number of descriptors of each kind one set of this shape consumes.
    pub fn count_per_kind(&self) -> BTreeMap<BindingKind, u32> {
        let mut counts = BTreeMap::new();
        for range in &self.ranges {
            *counts.entry(range.kind).or_insert(0) += range.count;
        }
        counts
    }

    pub fn descriptor_count(&self) -> u32 {
        self.ranges.iter().map(|r| r.count).sum()
    }
}

/// One addressable descriptor of a set: flat slot `i` maps to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    pub kind: BindingKind,
    pub binding: u32,
    pub array_element: u32,
}

#[must_use = "set layouts must be released with Device::destroy_descriptor_set_layout"]
#[derive(Debug)]
pub struct DescriptorSetLayout {
    pub(crate) key: SetLayoutKey,
    pub(crate) description: DescriptorSetDescription,
    pub(crate) slots: Vec<DescriptorSlot>,
}

impl DescriptorSetLayout {
    pub fn description(&self) -> &DescriptorSetDescription {
        &self.description
    }

    pub fn slots(&self) -> &[DescriptorSlot] {
        &self.slots
    }

    pub fn descriptor_count(&self) -> u32 {
        self.slots.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorCapacity {
    pub kind: BindingKind,
    pub count: u32,
}

impl DescriptorCapacity {
    pub const fn new(kind: BindingKind, count: u32) -> Self {
        Self { kind, count }
    }
}

/// Host-side accounting of a storage: which index ranges are taken and how
/// many descriptors of each kind were handed out.
#[derive(Debug, Clone)]
pub(crate) struct StorageBook {
    max_sets: u32,
    capacity: BTreeMap<BindingKind, u32>,
    used: BTreeMap<BindingKind, u32>,
    ranges: Vec<(u32, u32)>,
    total: u32,
}

impl StorageBook {
    pub(crate) fn new(max_sets: u32, capacities: &[DescriptorCapacity]) -> Self {
        let mut capacity = BTreeMap::new();
        for cap in capacities {
            *capacity.entry(cap.kind).or_insert(0) += cap.count;
        }
        let total = capacity.values().sum();
        Self { max_sets, capacity, used: BTreeMap::new(), ranges: Vec::new(), total }
    }

    /// Reserve consecutive index ranges for `layouts`, all or nothing.
    pub(crate) fn reserve(&mut self, starting_index: u32, layouts: &[&DescriptorSetLayout]) -> Result<Vec<u32>> {
        if self.ranges.len() + layouts.len() > self.max_sets as usize {
            exhausted!(
                "descriptor storage holds at most {} sets ({} allocated, {} requested)",
                self.max_sets,
                self.ranges.len(),
                layouts.len()
            );
        }

        let mut demand: BTreeMap<BindingKind, u32> = BTreeMap::new();
        for layout in layouts {
            for (kind, count) in layout.description.count_per_kind() {
                *demand.entry(kind).or_insert(0) += count;
            }
        }
        for (kind, wanted) in &demand {
            let cap = self.capacity.get(kind).copied().unwrap_or(0);
            let used = self.used.get(kind).copied().unwrap_or(0);
            if used + wanted > cap {
                exhausted!(
                    "descriptor storage capacity for {:?} exceeded: {} in use, {} requested, {} declared",
                    kind,
                    used,
                    wanted,
                    cap
                );
            }
        }

        let mut starts = Vec::with_capacity(layouts.len());
        let mut cursor = starting_index;
        let mut planned: Vec<(u32, u32)> = Vec::new();
        for layout in layouts {
            let len = layout.descriptor_count();
            let end = cursor as u64 + len as u64;
            if end > self.total as u64 {
                violation!(
                    "descriptor range {}..{} runs past the end of the storage ({} descriptors)",
                    cursor,
                    end,
                    self.total
                );
            }
            let end = end as u32;
            let overlaps = self
                .ranges
                .iter()
                .chain(planned.iter())
                .any(|&(start, stop)| cursor < stop && start < end);
            if overlaps {
                violation!("descriptor range {}..{} overlaps an allocated set", cursor, end);
            }
            planned.push((cursor, end));
            starts.push(cursor);
            cursor = end;
        }

        for (kind, wanted) in demand {
            *self.used.entry(kind).or_insert(0) += wanted;
        }
        self.ranges.extend(planned);
        Ok(starts)
    }

    /// First index after the highest allocated range.
    pub(crate) fn next_free_index(&self) -> u32 {
        self.ranges.iter().map(|&(_, end)| end).max().unwrap_or(0)
    }

    pub(crate) fn reset(&mut self) {
        self.used.clear();
        self.ranges.clear();
    }

    pub(crate) fn allocated_sets(&self) -> usize {
        self.ranges.len()
    }

    pub(crate) fn remaining(&self, kind: BindingKind) -> u32 {
        self.capacity.get(&kind).copied().unwrap_or(0) - self.used.get(&kind).copied().unwrap_or(0)
    }
}

/// Pool of descriptors from which sets are carved.
#[must_use = "descriptor storages must be released with Device::destroy_descriptor_storage"]
#[derive(Debug)]
pub struct DescriptorStorage {
    pub(crate) key: DescriptorStorageKey,
    pub(crate) capacities: Vec<DescriptorCapacity>,
    pub(crate) book: Mutex<StorageBook>,
}

impl DescriptorStorage {
    pub fn capacities(&self) -> &[DescriptorCapacity] {
        &self.capacities
    }

    /// Index right after the last allocated set; a good `starting_index` for
    /// the next allocation.
    pub fn next_free_index(&self) -> u32 {
        self.book.lock().next_free_index()
    }

    pub fn allocated_sets(&self) -> usize {
        self.book.lock().allocated_sets()
    }

    pub fn remaining(&self, kind: BindingKind) -> u32 {
        self.book.lock().remaining(kind)
    }
}

/// A concrete instance of a layout carved out of a storage.
///
/// Borrows the storage so the storage cannot be reset or destroyed while the
/// set is still reachable.
#[derive(Debug)]
pub struct AllocatedDescriptorSet<'s> {
    pub(crate) key: DescriptorSetKey,
    pub(crate) storage: DescriptorStorageKey,
    pub(crate) layout: SetLayoutKey,
    pub(crate) description: DescriptorSetDescription,
    pub(crate) starting_index: u32,
    pub(crate) slots: Vec<DescriptorSlot>,
    pub(crate) contents: Mutex<Vec<Option<WriteValue>>>,
    pub(crate) _storage: PhantomData<&'s DescriptorStorage>,
}

impl AllocatedDescriptorSet<'_> {
    pub fn starting_index(&self) -> u32 {
        self.starting_index
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_fully_populated(&self) -> bool {
        self.contents.lock().iter().all(Option::is_some)
    }

    /// Slots that have not been written yet.
    pub fn unpopulated_slots(&self) -> Vec<u32> {
        self.contents
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub(crate) fn slot(&self, slot: u32) -> Result<DescriptorSlot> {
        match self.slots.get(slot as usize) {
            Some(s) => Ok(*s),
            None => violation!("slot {} is out of range for a set of {} slots", slot, self.slots.len()),
        }
    }

    pub(crate) fn record_write(&self, slot: u32, value: WriteValue) {
        if let Some(entry) = self.contents.lock().get_mut(slot as usize) {
            *entry = Some(value);
        }
    }

    /// Buffers reachable through this set, directly or through texel views.
    pub(crate) fn referenced_buffers(&self) -> Vec<BufferKey> {
        self.contents
            .lock()
            .iter()
            .filter_map(|v| match v {
                Some(WriteValue::Buffer { key, .. }) => Some(*key),
                Some(WriteValue::TexelBuffer { buffer, .. }) => Some(*buffer),
                _ => None,
            })
            .collect()
    }
}

/// One value written into one slot of a set.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorValue<'a> {
    ConstantBuffer { buffer: &'a Buffer, offset: u64, size: u64 },
    SampledImage(&'a ImageView<'a>),
    InputAttachment(&'a ImageView<'a>),
    StorageBuffer { buffer: &'a Buffer, offset: u64, size: u64 },
    StorageImage(&'a ImageView<'a>),
    Sampler(&'a Sampler),
    UniformTexelBuffer(&'a BufferView<'a>),
}

impl DescriptorValue<'_> {
    pub fn kind(&self) -> BindingKind {
        match self {
            DescriptorValue::ConstantBuffer { .. } => BindingKind::ConstantBuffer,
            DescriptorValue::SampledImage(_) => BindingKind::SampledImage,
            DescriptorValue::InputAttachment(_) => BindingKind::InputAttachment,
            DescriptorValue::StorageBuffer { .. } => BindingKind::StorageBuffer,
            DescriptorValue::StorageImage(_) => BindingKind::StorageImage,
            DescriptorValue::Sampler(_) => BindingKind::Sampler,
            DescriptorValue::UniformTexelBuffer(_) => BindingKind::UniformTexelBuffer,
        }
    }
}

/// A checked write with handles reduced to registry keys, as the backends see it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedWrite {
    pub slot_index: u32,
    pub slot: DescriptorSlot,
    pub value: WriteValue,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteValue {
    Buffer { key: BufferKey, offset: u64, size: u64 },
    Image { key: ImageViewKey },
    Sampler { key: SamplerKey },
    TexelBuffer { key: BufferViewKey, buffer: BufferKey },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(desc: DescriptorSetDescription) -> DescriptorSetLayout {
        let slots = desc.slots();
        DescriptorSetLayout { key: SetLayoutKey::default(), description: desc, slots }
    }

    fn one_cbv() -> DescriptorSetLayout {
        layout(DescriptorSetDescription::new(ShaderStages::VERTEX).with(BindingKind::ConstantBuffer, 0, 1))
    }

    #[test]
    fn slots_flatten_ranges_in_order() {
        let desc = DescriptorSetDescription::new(ShaderStages::ALL_GRAPHICS)
            .with(BindingKind::ConstantBuffer, 0, 1)
            .with(BindingKind::SampledImage, 1, 3)
            .with(BindingKind::Sampler, 4, 1);
        let slots = desc.slots();
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[2], DescriptorSlot { kind: BindingKind::SampledImage, binding: 1, array_element: 1 });
        assert_eq!(slots[4].binding, 4);
        assert_eq!(desc.count_per_kind()[&BindingKind::SampledImage], 3);
    }

    #[test]
    fn identical_descriptions_compare_equal() {
        let a = DescriptorSetDescription::new(ShaderStages::FRAGMENT).with(BindingKind::SampledImage, 0, 2);
        let b = DescriptorSetDescription::new(ShaderStages::FRAGMENT).with(BindingKind::SampledImage, 0, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let desc = DescriptorSetDescription::new(ShaderStages::ALL)
            .with(BindingKind::ConstantBuffer, 0, 1)
            .with(BindingKind::StorageBuffer, 0, 1);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn capacity_is_enforced_exactly() {
        let cbv = one_cbv();
        let mut book = StorageBook::new(8, &[DescriptorCapacity::new(BindingKind::ConstantBuffer, 2)]);
        assert_eq!(book.reserve(0, &[&cbv]).unwrap(), vec![0]);
        assert_eq!(book.reserve(1, &[&cbv]).unwrap(), vec![1]);
        let err = book.reserve(2, &[&cbv]).unwrap_err();
        assert!(crate::error::classify(&err).unwrap().is_allocation());
        // A failed reservation leaves the book untouched.
        assert_eq!(book.allocated_sets(), 2);
    }

    #[test]
    fn multi_set_reservation_is_all_or_nothing() {
        let cbv = one_cbv();
        let mut book = StorageBook::new(8, &[DescriptorCapacity::new(BindingKind::ConstantBuffer, 3)]);
        assert!(book.reserve(0, &[&cbv, &cbv, &cbv, &cbv]).is_err());
        assert_eq!(book.allocated_sets(), 0);
        assert_eq!(book.reserve(0, &[&cbv, &cbv, &cbv]).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn max_sets_and_overlap() {
        let cbv = one_cbv();
        let mut book = StorageBook::new(1, &[DescriptorCapacity::new(BindingKind::ConstantBuffer, 4)]);
        book.reserve(0, &[&cbv]).unwrap();
        assert!(crate::error::classify(&book.reserve(1, &[&cbv]).unwrap_err()).unwrap().is_allocation());

        let mut book = StorageBook::new(4, &[DescriptorCapacity::new(BindingKind::ConstantBuffer, 4)]);
        book.reserve(1, &[&cbv]).unwrap();
        let err = book.reserve(1, &[&cbv]).unwrap_err();
        assert!(crate::error::classify(&err).unwrap().is_contract_violation());
        assert_eq!(book.next_free_index(), 2);
        book.reset();
        assert_eq!(book.next_free_index(), 0);
        assert_eq!(book.remaining(BindingKind::ConstantBuffer), 4);
    }
}
