use k8s_openapi::NamespaceResourceScope;
use kube::{core::object::HasStatus, Api, Client, Resource};

pub mod operations;

pub trait FromStatus<S> {
    fn from_status(status: S) -> Self;
}

impl<T: Default + HasStatus<Status = S>, S> FromStatus<S> for T {
    fn from_status(status: S) -> Self {
        let mut object = Self::default();

        *object.status_mut() = Some(status);

        object
    }
}

pub trait GetApi {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T>;
    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T>;
}

impl GetApi for Client {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T> {
        Api::all(self.clone())
    }

    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T> {
        Api::namespaced(self.clone(), namespace)
    }
}

/// `true` when the API returned the given HTTP status code.
pub fn is_api_error(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

pub fn is_not_found(error: &kube::Error) -> bool {
    is_api_error(error, 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    is_api_error(error, 409)
}
