//! Typed-UUID ids, following the same pattern the teacher uses for
//! `quick_junit::ReportUuid`: a zero-sized tag type paired with
//! [`newtype_uuid::TypedUuid`] so that a `JobId` and a `TestId` can never be
//! confused with each other at compile time even though both are UUIDs under
//! the hood.

use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};

/// Tag for [`JobId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {}

impl TypedUuidKind for JobKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("job");
        TAG
    }
}

/// Uniquely identifies a [`crate::JobLocator`].
pub type JobId = TypedUuid<JobKind>;

/// Tag for [`TestId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestKind {}

impl TypedUuidKind for TestKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("test");
        TAG
    }
}

/// Uniquely identifies one attempt (`TestExecutionUnit`) of a test.
pub type TestId = TypedUuid<TestKind>;

/// Tag for [`DeviceUuid`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {}

impl TypedUuidKind for DeviceKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("device");
        TAG
    }
}

/// Uniquely identifies a physical (or proxied) device.
pub type DeviceUuid = TypedUuid<DeviceKind>;

/// Tag for [`RunId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("run");
        TAG
    }
}

/// Identifies one lab-server process lifetime; attached to master sync
/// RPCs for de-duplication on the master side.
pub type RunId = TypedUuid<RunKind>;
