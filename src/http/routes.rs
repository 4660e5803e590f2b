use axum::Router;
use crate::app::BillingContext;

/// Trait for composable route modules
///
/// Implement this trait to group routes that share a prefix. Handlers use
/// `State<BillingContext>` to reach the engine.
///
/// # Example
///
/// ```ignore
/// struct AdminModule;
///
/// impl RouteModule for AdminModule {
///     fn routes(&self) -> Router<BillingContext> {
///         Router::new().route("/grace-sweep", post(run_sweep))
///     }
///
///     fn prefix(&self) -> Option<&str> {
///         Some("/admin/billing")
///     }
/// }
/// ```
pub trait RouteModule {
    /// Routes without state applied; state is attached once the modules
    /// are merged.
    fn routes(&self) -> Router<BillingContext>
    where
        Self: Sized;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the router
    fn register(self, router: Router<BillingContext>) -> Router<BillingContext>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}
