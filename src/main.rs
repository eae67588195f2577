fn main() {
    cadenza_lib::run()
}
