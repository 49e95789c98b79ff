macro_rules! v1_path {
    ($path:literal) => {
        concat!("/api/v1", $path)
    };
}

pub const HEALTH: &str = "/health";

/// Versioned API route definitions shared by the server and its clients
pub mod v1 {
    pub const ROOT: &str = "/api/v1";
    pub const VERSION: &str = "v1";

    pub mod analyses {
        pub const COLLECTION: &str = v1_path!("/analyses");
        pub const EXPORT: &str = v1_path!("/analyses/export");
        pub const ITEM: &str = v1_path!("/analyses/{id}");
        pub const CANCEL: &str = v1_path!("/analyses/{id}/cancel");
        pub const RETRY: &str = v1_path!("/analyses/{id}/retry");
        pub const RESULT: &str = v1_path!("/analyses/{id}/result");
        pub const FEEDBACK: &str = v1_path!("/analyses/{id}/feedback");
        pub const MODULE: &str = v1_path!("/analyses/{id}/modules/{module}");
    }

    pub mod batches {
        pub const COLLECTION: &str = v1_path!("/batches");
        pub const ITEM: &str = v1_path!("/batches/{id}");
    }

    pub mod queue {
        pub const STATUS: &str = v1_path!("/queue/status");
        pub const PENDING: &str = v1_path!("/queue/pending");
        pub const FAILED: &str = v1_path!("/queue/failed");
    }
}

pub mod utils {
    /// Replace a single path parameter (e.g. `"{id}"`) with the provided value.
    pub fn replace_param(route: &str, param: &str, value: impl AsRef<str>) -> String {
        route.replace(param, value.as_ref())
    }

    /// Replace multiple path parameters in order.
    pub fn replace_params(route: &str, params: &[(impl AsRef<str>, impl AsRef<str>)]) -> String {
        let mut path = route.to_string();
        for (param, value) in params {
            path = path.replace(param.as_ref(), value.as_ref());
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_versioned() {
        assert_eq!(v1::analyses::CANCEL, "/api/v1/analyses/{id}/cancel");
        assert!(v1::queue::STATUS.starts_with(v1::ROOT));
    }

    #[test]
    fn params_are_substituted() {
        assert_eq!(
            utils::replace_params(v1::analyses::MODULE, &[("{id}", "abc"), ("{module}", "persona")]),
            "/api/v1/analyses/abc/modules/persona"
        );
        assert_eq!(
            utils::replace_param(v1::batches::ITEM, "{id}", "b-1"),
            "/api/v1/batches/b-1"
        );
    }
}
