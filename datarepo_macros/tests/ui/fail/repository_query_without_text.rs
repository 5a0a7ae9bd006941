use datarepo_macros::{Entity, repository};

#[derive(Entity)]
struct User { #[fetch(id)] id: i64, email: String }

#[repository(entity = User, queries(by_email(email: String) -> Vec))]
mod users_repo {}

fn main() {}
