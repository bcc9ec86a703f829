/// Identifies a registered [`Channel`](super::Channel) within a loop's
/// channel slab. Cheap, `Copy`, and stable for the Channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);
