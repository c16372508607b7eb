/// Per-input-stream attributes consulted while planning jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputStreamDescriptor {
    pub is_teleportable: bool,
    pub is_primary: bool,
    pub is_versioned: bool,
}

impl InputStreamDescriptor {
    pub fn new(is_teleportable: bool, is_primary: bool, is_versioned: bool) -> Self {
        Self {
            is_teleportable,
            is_primary,
            is_versioned,
        }
    }

    /// Descriptor of intermediate data produced by an upstream phase.
    pub fn intermediate() -> Self {
        Self::new(false, true, false)
    }

    pub fn is_foreign(&self) -> bool {
        !self.is_primary
    }

    pub fn is_unversioned(&self) -> bool {
        !self.is_versioned
    }
}

/// InputStreamDirectory maps stream indices to descriptors. Out-of-range
/// indices resolve to the default descriptor, which must be primary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InputStreamDirectory {
    descriptors: Vec<InputStreamDescriptor>,
    default_descriptor: InputStreamDescriptor,
}

impl InputStreamDirectory {
    pub fn new(descriptors: Vec<InputStreamDescriptor>) -> Self {
        Self::with_default(descriptors, InputStreamDescriptor::intermediate())
    }

    pub fn with_default(
        descriptors: Vec<InputStreamDescriptor>,
        default_descriptor: InputStreamDescriptor,
    ) -> Self {
        assert!(default_descriptor.is_primary);
        Self {
            descriptors,
            default_descriptor,
        }
    }

    pub fn descriptor(&self, input_stream_index: usize) -> &InputStreamDescriptor {
        self.descriptors
            .get(input_stream_index)
            .unwrap_or(&self.default_descriptor)
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }
}

impl Default for InputStreamDirectory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn out_of_range_index_falls_back_to_default() {
        let directory = InputStreamDirectory::new(vec![InputStreamDescriptor::new(
            true, true, false,
        )]);

        assert!(directory.descriptor(0).is_teleportable);
        assert!(!directory.descriptor(7).is_teleportable);
        assert!(directory.descriptor(7).is_primary);
    }
}
