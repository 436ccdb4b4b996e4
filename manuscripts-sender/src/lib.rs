pub mod browse;
pub mod submit;

pub use browse::{MdnsBrowser, RecordCache, list_receivers, resolve_by_name};
pub use submit::{
    Receipt, SendError, SubmitOptions, submit_file, submit_to_record, submit_url_for_address,
};
