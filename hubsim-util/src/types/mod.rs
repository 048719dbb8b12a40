mod device_id;
mod shared_access_key;

pub use device_id::{DeviceId, InvalidDeviceIdError};
pub use shared_access_key::SharedAccessKey;
