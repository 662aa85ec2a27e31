pub mod matcher;

pub use matcher::{
    host_matches, hostname_from_url_filter, normalize_url, url_filter_for, validate_hostname, FilterError,
    FilterResult, Origin,
};
