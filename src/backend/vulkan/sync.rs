// Synchronization primitives
//
// Every submission carries an internal fence so the queue timeline can tell
// when a serial finished. Retired fences are reset and recycled.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use ash::vk;

pub(super) fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
    let fence_info = vk::FenceCreateInfo::builder().flags(flags);
    unsafe { device.create_fence(&fence_info, None) }.context("Failed to create fence")
}

pub(super) fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.create_semaphore(&semaphore_info, None) }.context("Failed to create semaphore")
}

/// Unsignalled fences ready to be attached to a submission.
#[derive(Debug, Default)]
pub(super) struct FencePool {
    free: Vec<vk::Fence>,
}

impl FencePool {
    pub fn acquire(&mut self, device: &ash::Device) -> Result<vk::Fence> {
        match self.free.pop() {
            Some(fence) => Ok(fence),
            None => create_fence(device, false),
        }
    }

    /// Hand back a fence that is known to be unsignalled.
    pub fn release(&mut self, fence: vk::Fence) {
        self.free.push(fence);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for fence in self.free.drain(..) {
            unsafe { device.destroy_fence(fence, None) };
        }
    }
}

/// Submission timeline of one logical queue.
#[derive(Debug, Default)]
pub(super) struct Timeline {
    pub next_serial: u64,
    pub completed: u64,
    pub in_flight: VecDeque<(u64, vk::Fence)>,
}

impl Timeline {
    pub fn push(&mut self, fence: vk::Fence) -> u64 {
        self.next_serial += 1;
        self.in_flight.push_back((self.next_serial, fence));
        self.next_serial
    }

    /// Retire finished submissions in order; returns the last completed serial.
    pub fn poll(&mut self, device: &ash::Device, pool: &mut FencePool) -> Result<u64> {
        while let Some(&(serial, fence)) = self.in_flight.front() {
            let done = unsafe { device.get_fence_status(fence) }.context("Failed to query submission fence")?;
            if !done {
                break;
            }
            unsafe { device.reset_fences(&[fence]) }.context("Failed to reset submission fence")?;
            pool.release(fence);
            self.completed = serial;
            self.in_flight.pop_front();
        }
        Ok(self.completed)
    }

    pub fn pending_fences(&self) -> Vec<vk::Fence> {
        self.in_flight.iter().map(|&(_, fence)| fence).collect()
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, fence) in self.in_flight.drain(..) {
            unsafe { device.destroy_fence(fence, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn serials_increase_per_submission() {
        let mut timeline = Timeline::default();
        let first = timeline.push(vk::Fence::from_raw(1));
        let second = timeline.push(vk::Fence::from_raw(2));
        assert_eq!((first, second), (1, 2));
        assert_eq!(timeline.pending_fences(), vec![vk::Fence::from_raw(1), vk::Fence::from_raw(2)]);
        assert_eq!(timeline.completed, 0);
    }
}
