pub mod conv;
pub mod init;
pub mod layers;
pub mod module;
pub mod norm;
pub mod pool;
pub mod sequential;

pub use conv::Conv2d;
pub use layers::*;
pub use module::*;
pub use norm::BatchNorm2d;
pub use pool::AdaptiveAvgPool2d;
pub use sequential::*;
