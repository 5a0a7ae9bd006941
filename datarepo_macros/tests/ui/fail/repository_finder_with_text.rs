use datarepo_macros::{Entity, repository};

#[derive(Entity)]
struct User { #[fetch(id)] id: i64, email: String }

#[repository(
    entity = User,
    finders(find_by_email(email: String) -> Vec = "select u from User u where u.email = :email")
)]
mod users_repo {}

fn main() {}
