pub(crate) mod middleware;
pub(crate) mod router;
