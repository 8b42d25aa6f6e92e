fn main() {
    object3d_detector::cli::run();
}
