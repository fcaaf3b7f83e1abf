#[macro_use]
extern crate rocket;

#[launch]
fn rocket() -> _ {
    mailbridge_sync::rocket()
}
