mod descriptor;
pub use descriptor::TensorDescriptor;

mod encoding;
pub use encoding::{Encoding, EncodingError, ScalarReader};

mod layout;
pub use layout::{Coords, Dims, Extents, Layout, MAX_DIMS};
