use datarepo_macros::{Entity, repository};

#[derive(Entity)]
struct User { #[fetch(id)] id: i64, email: String }

#[repository(entity = User, finders(find_by_email(email: String) -> HashMap))]
mod users_repo {}

fn main() {}
