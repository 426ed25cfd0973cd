use rocket::Route;

mod archive;
mod auth;
mod voting;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(auth::routes());
    routes.extend(voting::routes());
    routes.extend(archive::routes());
    routes
}
